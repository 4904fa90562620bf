use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
#[cfg(windows)]
use windows::Win32::Foundation::{LocalFree, HLOCAL};
#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
};

/// Whether stored values are encrypted for the current user (DPAPI) or only encoded.
pub const ENCRYPTED_AT_REST: bool = cfg!(windows);

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vault file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("missing vault key: {0}")]
    MissingKey(String),
    #[error("vault value for {0} is not valid")]
    InvalidValue(String),
    #[error("vault protection failed: {0}")]
    Protect(String),
}

/// Local secret store: a JSON map of base64 values. On Windows each value is
/// DPAPI-protected for the current user first; elsewhere values are only
/// encoded and the file is made owner-readable.
#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    store: VaultStore,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultStore {
    entries: HashMap<String, String>,
}

impl Vault {
    pub fn open(path: Option<&str>) -> Result<Self, VaultError> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => default_vault_path(),
        };
        Self::open_at(path)
    }

    pub fn open_at(path: PathBuf) -> Result<Self, VaultError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VaultStore::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, store })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&mut self, key: &str, value: &str) -> Result<(), VaultError> {
        let encoded = general_purpose::STANDARD.encode(protect(value.as_bytes())?);
        self.store.entries.insert(key.to_string(), encoded);
        self.persist()
    }

    pub fn retrieve(&self, key: &str) -> Result<String, VaultError> {
        let encoded = self
            .store
            .entries
            .get(key)
            .ok_or_else(|| VaultError::MissingKey(key.to_string()))?;
        let sealed = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::InvalidValue(key.to_string()))?;
        let raw = unprotect(&sealed)?;
        String::from_utf8(raw).map_err(|_| VaultError::InvalidValue(key.to_string()))
    }

    pub fn remove(&mut self, key: &str) -> Result<bool, VaultError> {
        let removed = self.store.entries.remove(key).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.store.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn persist(&self) -> Result<(), VaultError> {
        let data = serde_json::to_string_pretty(&self.store)?;
        fs::write(&self.path, data)?;
        restrict_permissions(&self.path)?;
        Ok(())
    }
}

fn default_vault_path() -> PathBuf {
    match crate::config::project_dirs() {
        Some(dirs) => dirs.config_dir().join("vault.json"),
        None => PathBuf::from("vault.json"),
    }
}

#[cfg(windows)]
fn protect(data: &[u8]) -> Result<Vec<u8>, VaultError> {
    unsafe {
        let in_blob = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut out_blob = CRYPT_INTEGER_BLOB::default();
        CryptProtectData(
            &in_blob,
            None,
            None,
            None,
            None,
            CRYPTPROTECT_UI_FORBIDDEN,
            &mut out_blob,
        )
        .map_err(|err| VaultError::Protect(err.to_string()))?;
        Ok(take_blob(out_blob))
    }
}

#[cfg(windows)]
fn unprotect(data: &[u8]) -> Result<Vec<u8>, VaultError> {
    unsafe {
        let in_blob = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut out_blob = CRYPT_INTEGER_BLOB::default();
        CryptUnprotectData(
            &in_blob,
            None,
            None,
            None,
            None,
            CRYPTPROTECT_UI_FORBIDDEN,
            &mut out_blob,
        )
        .map_err(|err| VaultError::Protect(err.to_string()))?;
        Ok(take_blob(out_blob))
    }
}

/// Copies a DPAPI output blob and frees the system allocation.
#[cfg(windows)]
unsafe fn take_blob(blob: CRYPT_INTEGER_BLOB) -> Vec<u8> {
    let out = std::slice::from_raw_parts(blob.pbData, blob.cbData as usize).to_vec();
    let _ = LocalFree(HLOCAL(blob.pbData as *mut _));
    out
}

#[cfg(not(windows))]
fn protect(data: &[u8]) -> Result<Vec<u8>, VaultError> {
    Ok(data.to_vec())
}

#[cfg(not(windows))]
fn unprotect(data: &[u8]) -> Result<Vec<u8>, VaultError> {
    Ok(data.to_vec())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault(name: &str) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("prizrak-vault-{}-{name}", std::process::id()))
            .join("vault.json");
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn values_survive_reopen() {
        let path = temp_vault("reopen");
        let mut vault = Vault::open_at(path.clone()).unwrap();
        vault.store("prizrak_password", "p@ss wörd").unwrap();
        vault.store("another", "x").unwrap();

        let reopened = Vault::open_at(path.clone()).unwrap();
        assert_eq!(reopened.retrieve("prizrak_password").unwrap(), "p@ss wörd");
        assert_eq!(reopened.list_keys(), vec!["another", "prizrak_password"]);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("p@ss"));
        assert_eq!(reopened.path(), path.as_path());
        fs::remove_file(&path).unwrap();
    }

    #[cfg(not(windows))]
    #[test]
    fn values_are_encoded_not_encrypted_off_windows() {
        assert!(!ENCRYPTED_AT_REST);
        let path = temp_vault("encoded");
        let mut vault = Vault::open_at(path.clone()).unwrap();
        vault.store("k", "secret").unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains(&general_purpose::STANDARD.encode("secret")));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_and_removed_keys() {
        let path = temp_vault("remove");
        let mut vault = Vault::open_at(path.clone()).unwrap();
        assert!(matches!(vault.retrieve("nope"), Err(VaultError::MissingKey(_))));

        vault.store("k", "v").unwrap();
        assert!(vault.remove("k").unwrap());
        assert!(!vault.remove("k").unwrap());
        assert!(vault.list_keys().is_empty());
        fs::remove_file(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn vault_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let path = temp_vault("perms");
        let mut vault = Vault::open_at(path.clone()).unwrap();
        vault.store("k", "v").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        fs::remove_file(&path).unwrap();
    }
}
