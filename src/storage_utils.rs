use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;

// CONFIGURATION STRUCTS
// config.json is deserialized straight into these types; every section has
// defaults so a partial file is enough.

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FetchConfig {
    pub provider_url: String,
    pub lookback_days: i64, // calendar days, raised to the downstream minimum
    pub timeout_secs: u64,
    pub max_retries: u32, // 0 = single attempt
    pub retry_backoff_ms: u64,
    pub concurrency: usize, // tickers fetched at once, 1 = sequential
    pub adjusted_close: bool,
    pub drop_unsettled_session: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            provider_url: "https://query1.finance.yahoo.com/v8/finance/chart".to_string(),
            lookback_days: 400,
            timeout_secs: 30,
            max_retries: 0,
            retry_backoff_ms: 500,
            concurrency: 1,
            adjusted_close: true,
            drop_unsettled_session: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExportConfig {
    pub file_name: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            file_name: "etf_data_with_returns.csv".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GithubConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_github_api")]
    pub api_url: String,
    #[serde(default = "default_github_path")]
    pub path: String,
    #[serde(default)]
    pub branch: Option<String>,
    // Name of the environment variable holding the token, never the token itself.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_committer_name")]
    pub committer_name: String,
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_github_path() -> String {
    "etf_data_with_returns.csv".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_committer_name() -> String {
    "ETF Update Bot".to_string()
}

fn default_committer_email() -> String {
    "etf-bot@automated.com".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub catalog_path: PathBuf,
    pub fetch: FetchConfig,
    pub export: ExportConfig,
    pub github: Option<GithubConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("etf_data.csv"),
            fetch: FetchConfig::default(),
            export: ExportConfig::default(),
            github: None,
        }
    }
}

// STORAGE MANAGER

#[derive(Debug, Clone)]
pub struct AsyncStorageManager {
    // Absolute path to the storage directory (e.g. ".../target/debug/storage")
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// **Constructor: new_relative**
    /// Storage directory resolved relative to the running executable, so the
    /// binary finds its config.json wherever it is launched from.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        // 1. Locate the running executable
        let exe_path = std::env::current_exe()?;

        // 2. Resolve its directory and append the relative path (e.g. "storage")
        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);

        Self::new(base_dir).await
    }

    /// **Constructor: new**
    /// Storage directory at an explicit location (the `--storage` flag),
    /// created if missing.
    pub async fn new<P: Into<PathBuf>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();

        // Create once up front so save() never has to check.
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }

        Ok(Self { base_dir })
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.base_dir.join(file_name)
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path(&format!("{}.json", filename)).exists()
    }

    /// **Generic Save Function**
    /// Serializes `data` to `<filename>.json` (pretty-printed so config.json
    /// stays hand-editable) through `write_atomic`.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<()> {
        let json_bytes = serde_json::to_vec_pretty(data)?;
        self.write_atomic(&format!("{}.json", filename), &json_bytes).await
    }

    /// **Atomic Write**
    /// Writes any file inside the storage directory (JSON or the CSV export).
    /// If the process dies mid-write the previous file is left untouched.
    pub async fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let final_path = self.base_dir.join(file_name);
        let tmp_path = self.base_dir.join(format!("{}.tmp", file_name));

        // 1. Write the data to a temporary file next to the target
        fs::write(&tmp_path, bytes).await?;

        // 2. Rename over the final name in one step
        fs::rename(tmp_path, final_path).await?;

        Ok(())
    }

    /// **Generic Load Function**
    /// Reads `<filename>.json` back into any deserializable type.
    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        let path = self.base_dir.join(format!("{}.json", filename));

        // serde_json validates UTF-8 while parsing, no need for read_to_string.
        let content = fs::read(path).await?;

        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }

    /// **Load or Initialize**
    /// Loads `<filename>.json`, or writes out and returns the default when
    /// absent so the user has a file to edit.
    pub async fn load_or_init<T>(&self, filename: &str) -> anyhow::Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        if self.exists(filename) {
            return self.load(filename).await;
        }
        let data = T::default();
        self.save(filename, &data).await?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path().join("storage")).await.unwrap();

        let mut config = AppConfig::default();
        config.fetch.max_retries = 3;
        storage.save("config", &config).await.unwrap();

        let loaded: AppConfig = storage.load("config").await.unwrap();
        assert_eq!(loaded.fetch.max_retries, 3);
        assert!(!storage.path("config.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();

        let config: AppConfig = storage.load_or_init("config").await.unwrap();
        assert_eq!(config.fetch.lookback_days, 400);
        assert!(config.github.is_none());
        assert!(storage.exists("config"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{
            "catalog_path": "my_etfs.csv",
            "fetch": { "concurrency": 4 },
            "github": { "owner": "acme", "repo": "etf-data" }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.fetch.concurrency, 4);
        assert_eq!(config.fetch.timeout_secs, 30);
        let github = config.github.unwrap();
        assert_eq!(github.token_env, "GITHUB_TOKEN");
        assert_eq!(github.api_url, "https://api.github.com");
        assert!(github.branch.is_none());
    }
}
