mod loader;
mod schema;

pub use loader::{load_from_path, validate};
pub use schema::{AwsSettings, AzureSettings, Config, GitHubSettings, ProxySettings};
