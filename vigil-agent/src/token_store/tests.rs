use super::*;
use tempfile::TempDir;

fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn empty_store_rejects_everything() {
    let store = TokenStore::new();
    assert!(store.is_empty());
    assert!(!store.is_valid("anything"));
    assert!(!store.is_valid(""));
}

#[test]
fn exact_membership() {
    let store = TokenStore::from_tokens(["DEV_TOKEN_123", "other"]);
    assert_eq!(store.len(), 2);
    assert!(store.is_valid("DEV_TOKEN_123"));
    assert!(store.is_valid("other"));
    assert!(!store.is_valid("DEV_TOKEN_12"));
    assert!(!store.is_valid("DEV_TOKEN_1234"));
    assert!(!store.is_valid("dev_token_123"));
}

#[test]
fn empty_token_never_validates() {
    let store = TokenStore::from_tokens(["", "real"]);
    assert_eq!(store.len(), 1);
    assert!(!store.is_valid(""));
}

#[test]
fn load_from_file() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "tokens.json", r#"{"tokens": ["a", "b"]}"#);

    let store = TokenStore::load(&path);
    assert_eq!(store.len(), 2);
    assert!(store.is_valid("a"));
    assert!(store.is_valid("b"));
}

#[test]
fn missing_file_fails_closed() {
    let dir = TempDir::new().unwrap();
    let store = TokenStore::load(&dir.path().join("nope.json"));
    assert!(store.is_empty());
    assert!(!store.is_valid("a"));
}

#[test]
fn malformed_file_fails_closed() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "tokens.json", "{tokens: [");
    assert!(TokenStore::load(&path).is_empty());

    let path = write_file(&dir, "wrong.json", r#"{"tokens": "a"}"#);
    assert!(TokenStore::load(&path).is_empty());
}

#[test]
fn file_without_tokens_key_is_empty() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "tokens.json", "{}");
    assert!(TokenStore::load(&path).is_empty());
}

#[test]
fn reload_replaces_and_failed_reload_clears() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "tokens.json", r#"{"tokens": ["old"]}"#);
    let store = TokenStore::load(&path);
    assert!(store.is_valid("old"));

    std::fs::write(&path, r#"{"tokens": ["new"]}"#).unwrap();
    assert_eq!(store.reload(&path), 1);
    assert!(!store.is_valid("old"));
    assert!(store.is_valid("new"));

    std::fs::remove_file(&path).unwrap();
    assert_eq!(store.reload(&path), 0);
    assert!(!store.is_valid("new"));
}

#[test]
fn debug_output_hides_tokens() {
    let store = TokenStore::from_tokens(["s3cret"]);
    let debug = format!("{:?}", store);
    assert!(!debug.contains("s3cret"));
    assert!(debug.contains('1'));
}
