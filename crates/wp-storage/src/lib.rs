//! Durable key-value side store used to keep undelivered control messages
//! across page reloads.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use wp_core::ProxyError;
use wp_core::ProxyResult;

/// Keyed storage contract consumed by the control channel.
///
/// Values are opaque strings; callers own their serialization.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> ProxyResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> ProxyResult<()>;
    fn remove(&self, key: &str) -> ProxyResult<()>;
}

/// File store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Partition the records live in, usually the proxied page origin.
    pub partition: String,
    pub ephemeral_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            partition: "global".to_owned(),
            ephemeral_mode: false,
        }
    }
}

impl StoreConfig {
    pub fn for_partition(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.partition.trim().is_empty() {
            return Err(ProxyError::new(
                "storage.partition_invalid",
                "store partition name must not be empty",
            ));
        }

        Ok(())
    }
}

/// Key-value store persisted as one file per partition under `root`.
///
/// Each record is a line of hex-encoded `key<TAB>value`, so arbitrary
/// serialized payloads survive without escaping rules.
#[derive(Debug)]
pub struct FileKeyValueStore {
    config: StoreConfig,
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(config: StoreConfig, root: PathBuf) -> ProxyResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_path(&self) -> ProxyResult<PathBuf> {
        if self.config.ephemeral_mode {
            return Err(ProxyError::new(
                "storage.persistence_disabled",
                "persistent storage is disabled in ephemeral mode",
            ));
        }

        let partition = sanitize_partition_name(&self.config.partition);
        Ok(self
            .root
            .join("partitions")
            .join(format!("{partition}.kv")))
    }

    fn guard(&self) -> ProxyResult<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| {
            ProxyError::new(
                "storage.lock_poisoned",
                "file store lock was poisoned by a panicking writer",
            )
        })
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> ProxyResult<Option<String>> {
        let path = self.partition_path()?;
        let _guard = self.guard()?;
        let map = read_partition_map(&path)?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ProxyResult<()> {
        let path = self.partition_path()?;
        let _guard = self.guard()?;
        let mut map = read_partition_map(&path)?;
        map.insert(key.to_owned(), value.to_owned());
        write_partition_map(&path, &map)
    }

    fn remove(&self, key: &str) -> ProxyResult<()> {
        let path = self.partition_path()?;
        let _guard = self.guard()?;
        let mut map = read_partition_map(&path)?;
        if map.remove(key).is_none() {
            return Ok(());
        }

        if map.is_empty() {
            if path.exists() {
                fs::remove_file(&path).map_err(|error| {
                    ProxyError::new(
                        "storage.partition_remove_failed",
                        format!(
                            "failed removing empty partition file `{}`: {error}",
                            path.display()
                        ),
                    )
                })?;
            }
            log::debug!("removed empty partition `{}`", self.config.partition);
            return Ok(());
        }

        write_partition_map(&path, &map)
    }
}

/// Process-local store; contents vanish with the instance.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> ProxyResult<MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries.lock().map_err(|_| {
            ProxyError::new(
                "storage.lock_poisoned",
                "memory store lock was poisoned by a panicking writer",
            )
        })
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> ProxyResult<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ProxyResult<()> {
        self.entries()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> ProxyResult<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}

fn sanitize_partition_name(input: &str) -> String {
    let mut out = String::new();
    for ch in input.trim().to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }

    if out.is_empty() {
        "unknown".to_owned()
    } else {
        out
    }
}

fn read_partition_map(path: &Path) -> ProxyResult<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = fs::read_to_string(path).map_err(|error| {
        ProxyError::new(
            "storage.partition_read_failed",
            format!(
                "failed to read partition file `{}`: {error}",
                path.display()
            ),
        )
    })?;

    let mut map = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        if line.is_empty() {
            continue;
        }

        let (key_hex, value_hex) = line.split_once('\t').ok_or_else(|| {
            ProxyError::new(
                "storage.partition_format_invalid",
                format!(
                    "invalid record format at `{}` line {}",
                    path.display(),
                    index + 1
                ),
            )
        })?;

        map.insert(decode_hex_string(key_hex)?, decode_hex_string(value_hex)?);
    }

    Ok(map)
}

fn write_partition_map(path: &Path, map: &BTreeMap<String, String>) -> ProxyResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            ProxyError::new(
                "storage.partition_dir_create_failed",
                format!(
                    "failed to create partition directory `{}`: {error}",
                    parent.display()
                ),
            )
        })?;
    }

    let mut encoded = String::new();
    for (key, value) in map {
        encoded.push_str(&encode_hex_string(key));
        encoded.push('\t');
        encoded.push_str(&encode_hex_string(value));
        encoded.push('\n');
    }

    // Readers only ever see a complete partition file.
    let staging = path.with_extension("kv.tmp");
    fs::write(&staging, encoded).map_err(|error| {
        ProxyError::new(
            "storage.partition_write_failed",
            format!(
                "failed to write partition file `{}`: {error}",
                staging.display()
            ),
        )
    })?;

    fs::rename(&staging, path).map_err(|error| {
        ProxyError::new(
            "storage.partition_write_failed",
            format!(
                "failed to move partition file into place at `{}`: {error}",
                path.display()
            ),
        )
    })
}

fn encode_hex_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len().saturating_mul(2));
    for byte in value.as_bytes() {
        out.push(hex_char(byte >> 4));
        out.push(hex_char(byte & 0x0f));
    }
    out
}

fn decode_hex_string(value: &str) -> ProxyResult<String> {
    let raw = value.as_bytes();
    if raw.len() % 2 != 0 {
        return Err(ProxyError::new(
            "storage.partition_hex_invalid",
            "hex field length must be even",
        ));
    }

    let mut bytes = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        let high = decode_hex_nibble(pair[0])?;
        let low = decode_hex_nibble(pair[1])?;
        bytes.push((high << 4) | low);
    }

    String::from_utf8(bytes).map_err(|error| {
        ProxyError::new(
            "storage.partition_utf8_invalid",
            format!("partition field is not valid UTF-8: {error}"),
        )
    })
}

fn hex_char(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        10..=15 => (b'a' + (value - 10)) as char,
        _ => '0',
    }
}

fn decode_hex_nibble(byte: u8) -> ProxyResult<u8> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(ProxyError::new(
            "storage.partition_hex_invalid",
            format!("invalid hex character `{}`", byte as char),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::FileKeyValueStore;
    use super::KeyValueStore;
    use super::MemoryKeyValueStore;
    use super::StoreConfig;
    use super::decode_hex_string;
    use super::encode_hex_string;

    fn temp_root() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(error) => panic!("{error}"),
        }
    }

    fn file_store(root: &tempfile::TempDir, partition: &str) -> FileKeyValueStore {
        let store = FileKeyValueStore::new(
            StoreConfig::for_partition(partition),
            root.path().to_path_buf(),
        );
        match store {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn file_store_roundtrips_values() {
        let root = temp_root();
        let store = file_store(&root, "site.example");

        let wrote = store.set("session-1", "[{\"cmd\":\"setCookie\"}]");
        assert!(wrote.is_ok());

        let loaded = store.get("session-1");
        assert_eq!(loaded, Ok(Some("[{\"cmd\":\"setCookie\"}]".to_owned())));
        assert_eq!(store.get("session-2"), Ok(None));
    }

    #[test]
    fn file_store_survives_reopen() {
        let root = temp_root();
        {
            let store = file_store(&root, "site.example");
            assert!(store.set("s", "v").is_ok());
        }

        let reopened = file_store(&root, "site.example");
        assert_eq!(reopened.get("s"), Ok(Some("v".to_owned())));
    }

    #[test]
    fn removing_last_key_deletes_partition_file() {
        let root = temp_root();
        let store = file_store(&root, "site.example");
        assert!(store.set("s", "v").is_ok());

        let partition_file = root.path().join("partitions").join("site.example.kv");
        assert!(partition_file.exists());

        assert!(store.remove("s").is_ok());
        assert!(!partition_file.exists());
        assert_eq!(store.get("s"), Ok(None));
    }

    #[test]
    fn partitions_are_isolated() {
        let root = temp_root();
        let first = file_store(&root, "a.example");
        let second = file_store(&root, "b.example");

        assert!(first.set("s", "one").is_ok());
        assert_eq!(second.get("s"), Ok(None));
    }

    #[test]
    fn corrupt_partition_reports_format_error() {
        let root = temp_root();
        let store = file_store(&root, "site.example");
        let dir = root.path().join("partitions");
        assert!(std::fs::create_dir_all(&dir).is_ok());
        assert!(std::fs::write(dir.join("site.example.kv"), "not-a-record\n").is_ok());

        let loaded = store.get("s");
        assert!(loaded.is_err());
        if let Err(error) = loaded {
            assert_eq!(error.code, "storage.partition_format_invalid");
        }
    }

    #[test]
    fn ephemeral_mode_blocks_persistence() {
        let root = temp_root();
        let config = StoreConfig {
            partition: "site.example".to_owned(),
            ephemeral_mode: true,
        };
        let store = FileKeyValueStore::new(config, root.path().to_path_buf());
        assert!(store.is_ok());
        let store = match store {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };

        let wrote = store.set("k", "v");
        assert!(wrote.is_err());
        if let Err(error) = wrote {
            assert_eq!(error.code, "storage.persistence_disabled");
        }
    }

    #[test]
    fn empty_partition_name_is_rejected() {
        let root = temp_root();
        let store = FileKeyValueStore::new(StoreConfig::for_partition("  "), root.path().into());
        assert!(store.is_err());
    }

    #[test]
    fn memory_store_behaves_like_a_map() {
        let store = MemoryKeyValueStore::new();
        assert!(store.is_empty());
        assert!(store.set("a", "1").is_ok());
        assert!(store.set("a", "2").is_ok());
        assert_eq!(store.get("a"), Ok(Some("2".to_owned())));
        assert!(store.remove("a").is_ok());
        assert!(store.is_empty());
    }

    #[test]
    fn hex_codec_handles_non_ascii() {
        let encoded = encode_hex_string("größe\tline\n");
        assert_eq!(decode_hex_string(&encoded), Ok("größe\tline\n".to_owned()));
        assert!(decode_hex_string("abc").is_err());
        assert!(decode_hex_string("zz").is_err());
    }
}
