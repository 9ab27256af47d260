pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# DOCPROC CONFIGURATION
# =============================================================================
# Every section is optional; omitted settings fall back to built-in defaults.
# Values may reference environment variables with $env{VAR_NAME}.
#
# The following environment variables override this file when set:
#   STORAGE_CONNECTION_STRING, AZURE_STORAGE_ACCOUNT_NAME,
#   AZURE_STORAGE_ACCOUNT_KEY, TABLE_NAME, SQL_DATABASE,
#   DOCUMENT_INTELLIGENCE_ENDPOINT, DOCUMENT_INTELLIGENCE_API_KEY,
#   OPENAI_ENDPOINT, OPENAI_API_KEY, OPENAI_API_VERSION, DOCPROC_LISTEN
#
# Credentials that are not configured only cause an error when a request
# actually needs them.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/docproc/config.yml
#   3. /etc/docproc/config.yml

# =============================================================================
# WEB
# =============================================================================
web:
  listen: "0.0.0.0:8000"
  # Largest accepted multipart body, in bytes
  max_upload_bytes: 52428800

# =============================================================================
# REQUEST STORE
# =============================================================================
# Batch requests queued via /queue_document are recorded here.
#   duckdb: embedded relational database file at `path`
#   table:  Azure Table Storage, partitioned by model deployment
#   memory: process-local, lost on restart (development only; the batch
#           commands refuse it)
store:
  backend: duckdb
  path: ~/.local/share/docproc/requests.duckdb
  table_name: BatchRequest
  # connection_string: $env{STORAGE_CONNECTION_STRING}
  timeout: 30s

# =============================================================================
# OBJECT STAGE
# =============================================================================
# Durable storage for queued uploads.
#   azure: Azure Blob Storage (connection string or account name/key)
#   local: directory tree under `local_root`
stage:
  backend: azure
  container: documents
  # connection_string: $env{STORAGE_CONNECTION_STRING}
  local_root: ~/.local/share/docproc/objects
  timeout: 60s
  # Lifetime of the read links sent with batch jobs
  sas_expiry: 48h

# =============================================================================
# STAGING
# =============================================================================
# Scratch space for synchronous requests. Each request gets its own
# directory, removed when the request finishes.
staging:
  dir: /tmp/document_processing

# =============================================================================
# TEXT EXTRACTION (Azure Document Intelligence)
# =============================================================================
extraction:
  # endpoint: $env{DOCUMENT_INTELLIGENCE_ENDPOINT}
  api_version: "2024-11-30"
  model: prebuilt-layout
  poll_interval: 1s
  timeout: 120s

# =============================================================================
# COMPLETION (Azure OpenAI)
# =============================================================================
completion:
  # endpoint: $env{OPENAI_ENDPOINT}
  # api_version: "2024-08-01-preview"
  batch_api_version: "2024-02-15-preview"
  timeout: 60s
"#
    .to_string()
}
