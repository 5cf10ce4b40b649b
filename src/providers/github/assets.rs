//! Files installed into the sprayer repository. They are kept as plain
//! source here and base64-encoded when uploaded through the contents API.

/// One-shot request executor run by the workflow. Inputs and outputs are
/// AES-256-GCM encrypted with the per-launcher key held as a repo secret.
pub const SPRAYER_PY: &str = r#"import base64
import binascii
import os
import sys

import requests
from Crypto.Cipher import AES
from Crypto.Random import get_random_bytes

KEY = binascii.unhexlify(os.environ["AES256_KEY_HEX"])
NONCE_SIZE = 12
TAG_SIZE = 16
LINE_CHUNK = 4000


def decrypt(value_hex):
    raw = binascii.unhexlify(value_hex)
    cipher = AES.new(KEY, AES.MODE_GCM, nonce=raw[:NONCE_SIZE])
    return cipher.decrypt_and_verify(raw[NONCE_SIZE:-TAG_SIZE], raw[-TAG_SIZE:])


def encrypt(value):
    nonce = get_random_bytes(NONCE_SIZE)
    cipher = AES.new(KEY, AES.MODE_GCM, nonce=nonce)
    ciphertext, tag = cipher.encrypt_and_digest(value)
    return binascii.hexlify(nonce + ciphertext + tag).decode()


def emit(prefix, value_hex):
    for i in range(0, len(value_hex), LINE_CHUNK):
        print(prefix + " " + value_hex[i:i + LINE_CHUNK])


try:
    method = decrypt(sys.argv[1]).decode()
    url = decrypt(sys.argv[2]).decode()
    raw_headers = decrypt(sys.argv[3]).decode()
    body = decrypt(sys.argv[4])

    headers = {}
    lines = raw_headers.split("\n") if raw_headers else []
    for i in range(0, len(lines) - 1, 2):
        headers[lines[i]] = lines[i + 1]

    resp = requests.request(
        method,
        url,
        headers=headers,
        data=body,
        verify=False,
        allow_redirects=False,
    )

    emit("RESP_STATUS_ENCRYPTED_HEX", encrypt(str(resp.status_code).encode()))

    header_lines = []
    for key, value in resp.headers.items():
        header_lines.append(key)
        header_lines.append(value)
    emit("RESP_HEADERS_ENCRYPTED_HEX", encrypt("\n".join(header_lines).encode()))

    emit("RESP_BODY_ENCRYPTED_HEX", encrypt(resp.content))
except Exception as exc:
    print("RESP_ERR " + base64.b64encode(str(exc).encode()).decode())
"#;

pub const REQUIREMENTS_TXT: &str = "requests\npycryptodome\n";

/// Dispatch-only workflow. The first step is named after the run identifier
/// so the poller can match job listings back to the dispatching caller.
pub const SPRAYER_YML: &str = r#"name: Sprayer

on:
  workflow_dispatch:
    inputs:
      methodEnc:
        required: true
        type: string
      urlEnc:
        required: true
        type: string
      headersEnc:
        required: true
        type: string
      bodyEnc:
        required: true
        type: string
      runIdentifier:
        required: true
        type: string

jobs:
  request:
    name: Request
    runs-on: ubuntu-latest
    steps:
      - name: ${{ inputs.runIdentifier }}
        run: "true"
      - uses: actions/checkout@v4
      - uses: actions/setup-python@v5
        with:
          python-version: "3.12"
      - name: Install dependencies
        run: pip3 install -r requirements.txt
      - name: Execute
        env:
          AES256_KEY_HEX: ${{ secrets.AES256_KEY_HEX }}
        run: >-
          python3 sprayer.py
          "${{ inputs.methodEnc }}"
          "${{ inputs.urlEnc }}"
          "${{ inputs.headersEnc }}"
          "${{ inputs.bodyEnc }}"
"#;
