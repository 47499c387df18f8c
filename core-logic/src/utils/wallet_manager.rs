use crate::error::WalletError;
use crate::security::SecurityUtils;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Decrypted contents of an encrypted wallet file. Only the Solana fields
/// are read; other chains' keys in the same file are ignored.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DecryptedWallet {
    #[serde(default)]
    pub sol_private_key: String,
    #[serde(default)]
    pub sol_address: String,
}

impl fmt::Debug for DecryptedWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedWallet")
            .field("sol_address", &self.sol_address)
            .field("sol_private_key", &"***REDACTED***")
            .finish()
    }
}

/// Where the main funding key was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainWalletSource {
    Env(String),
    JsonFile(PathBuf),
    RawFile(PathBuf),
}

/// Resolves the main funding wallet's secret key.
///
/// Lookup order: the `MAIN_WALLET_KEY` style environment variable, the first
/// encrypted file in `wallet-json/`, then the first key line in `pv.txt`.
pub struct WalletManager {
    env_var: String,
    search_roots: Vec<PathBuf>,
}

impl WalletManager {
    const WALLETS_DIR: &'static str = "wallet-json";
    const PV_FILE: &'static str = "pv.txt";

    pub fn new(env_var: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
            // Try current dir first, then workspace root (../../)
            search_roots: vec![PathBuf::from("."), PathBuf::from("../..")],
        }
    }

    pub fn with_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.search_roots = roots;
        self
    }

    /// True when the key would come from an encrypted file and therefore
    /// needs a password.
    pub fn needs_password(&self) -> bool {
        matches!(self.locate(), Some(MainWalletSource::JsonFile(_)))
    }

    pub fn locate(&self) -> Option<MainWalletSource> {
        if std::env::var(&self.env_var).is_ok_and(|v| !v.trim().is_empty()) {
            return Some(MainWalletSource::Env(self.env_var.clone()));
        }

        for root in &self.search_roots {
            let dir = root.join(Self::WALLETS_DIR);
            if dir.is_dir() {
                let mut entries: Vec<PathBuf> = fs::read_dir(&dir)
                    .into_iter()
                    .flatten()
                    .filter_map(|res| res.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                    .collect();
                entries.sort();
                if let Some(first) = entries.into_iter().next() {
                    return Some(MainWalletSource::JsonFile(first));
                }
            }
        }

        self.search_roots
            .iter()
            .map(|root| root.join(Self::PV_FILE))
            .find(|p| p.exists())
            .map(MainWalletSource::RawFile)
    }

    /// Loads the main wallet secret in its chain encoding.
    pub fn load_main_secret(&self, password: Option<&str>) -> Result<String, WalletError> {
        let source = self.locate().ok_or_else(|| WalletError::NotFound {
            checked: format!(
                "${}, {}/*.json, {}",
                self.env_var,
                Self::WALLETS_DIR,
                Self::PV_FILE
            ),
        })?;
        debug!("Main wallet source: {:?}", source);

        match source {
            MainWalletSource::Env(var) => {
                info!("Main wallet loaded from ${}", var);
                std::env::var(&var)
                    .map(|v| v.trim().to_string())
                    .map_err(|_| WalletError::NotFound { checked: var })
            }
            MainWalletSource::JsonFile(path) => {
                let wallet = Self::decrypt_json_wallet(&path, password)?;
                if wallet.sol_private_key.is_empty() {
                    return Err(WalletError::InvalidKeyFormat {
                        reason: format!("{:?} has no sol_private_key", path),
                    });
                }
                info!("Main wallet loaded from {:?} ({})", path, wallet.sol_address);
                Ok(wallet.sol_private_key.clone())
            }
            MainWalletSource::RawFile(path) => {
                let content = read(&path)?;
                let key = content
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty() && !line.starts_with('#'))
                    .ok_or_else(|| WalletError::InvalidKeyFormat {
                        reason: format!("{:?} contains no key", path),
                    })?;
                info!("Main wallet loaded from {:?}", path);
                Ok(key.to_string())
            }
        }
    }

    fn decrypt_json_wallet(path: &Path, password: Option<&str>) -> Result<DecryptedWallet, WalletError> {
        let content = read(path)?;
        let failed = |reason: String| WalletError::DecryptionFailed {
            path: path.display().to_string(),
            reason,
        };
        let json: Value = serde_json::from_str(&content).map_err(|e| failed(e.to_string()))?;

        let block = json
            .get("encrypted")
            .filter(|v| v.is_object())
            .ok_or_else(|| failed("missing 'encrypted' block".to_string()))?;
        let field = |name: &str| block.get(name).and_then(|v| v.as_str()).unwrap_or("");

        if field("ciphertext").is_empty() {
            return Err(failed("empty ciphertext".to_string()));
        }
        let pass = password.ok_or_else(|| failed("password required".to_string()))?;

        let decrypted = SecurityUtils::decrypt_components(
            field("ciphertext"),
            field("iv"),
            field("salt"),
            field("tag"),
            pass,
        )
        .map_err(|e| failed(e.to_string()))?;

        serde_json::from_str(&decrypted).map_err(|e| failed(e.to_string()))
    }
}

fn read(path: &Path) -> Result<String, WalletError> {
    fs::read_to_string(path).map_err(|e| WalletError::DecryptionFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityUtils;

    #[test]
    fn test_pv_file_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pv.txt"), "# main\n\n  abc123  \nother\n").unwrap();
        let manager = WalletManager::new("TEST_MAIN_KEY_UNSET_PV").with_roots(vec![dir.path().into()]);
        assert_eq!(manager.load_main_secret(None).unwrap(), "abc123");
        assert!(!manager.needs_password());
    }

    #[test]
    fn test_encrypted_wallet_json() {
        let dir = tempfile::tempdir().unwrap();
        let wallets = dir.path().join("wallet-json");
        fs::create_dir_all(&wallets).unwrap();
        let sealed = SecurityUtils::encrypt_components(
            r#"{"sol_private_key":"key58","sol_address":"addr"}"#,
            "pw",
        )
        .unwrap();
        let file = serde_json::json!({ "encrypted": sealed });
        fs::write(wallets.join("001.json"), file.to_string()).unwrap();

        let manager = WalletManager::new("TEST_MAIN_KEY_UNSET_JSON").with_roots(vec![dir.path().into()]);
        assert!(manager.needs_password());
        assert_eq!(manager.load_main_secret(Some("pw")).unwrap(), "key58");
        assert!(manager.load_main_secret(Some("bad")).is_err());
        assert!(manager.load_main_secret(None).is_err());
    }

    #[test]
    fn test_missing_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WalletManager::new("TEST_MAIN_KEY_UNSET_NONE").with_roots(vec![dir.path().into()]);
        assert!(matches!(
            manager.load_main_secret(None),
            Err(WalletError::NotFound { .. })
        ));
    }
}
