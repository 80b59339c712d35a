//! Tests for the layered configuration loader: `.env` file precedence,
//! provider credential parsing and validation failures.

use std::fs;
use std::path::Path;

use tempfile::tempdir;
use tunesync::config::{ConfigError, ConfigLoader};

// 43 base64url characters decode to a 32-byte key.
const CRYPTO_KEY_B64: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

fn write_env(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

fn base_env() -> String {
    format!(
        "TUNESYNC_PROFILE=test\n\
         TUNESYNC_OPERATOR_TOKEN=root-token\n\
         TUNESYNC_CRYPTO_KEY={}\n\
         TUNESYNC_DATABASE_URL=sqlite::memory:\n\
         TUNESYNC_LOG_LEVEL=debug\n",
        CRYPTO_KEY_B64
    )
}

#[test]
fn profile_env_file_overrides_the_base_file() {
    let dir = tempdir().unwrap();
    write_env(dir.path(), ".env", &base_env());
    write_env(
        dir.path(),
        ".env.test",
        "TUNESYNC_LOG_LEVEL=info\nTUNESYNC_OAUTH_SESSION_TTL_SECONDS=120\n",
    );

    let config = ConfigLoader::with_base_dir(dir.path().to_path_buf())
        .load()
        .unwrap();
    assert_eq!(config.profile, "test");
    assert_eq!(config.log_level, "info");
    assert_eq!(config.oauth.session_ttl_seconds, 120);
    assert_eq!(config.operator_tokens, vec!["root-token".to_string()]);
    assert_eq!(config.crypto_key.as_ref().map(Vec::len), Some(32));
}

#[test]
fn provider_credentials_are_parsed_from_prefixed_keys() {
    let dir = tempdir().unwrap();
    let mut env = base_env();
    env.push_str(
        "TUNESYNC_PROVIDER_APPLE_MUSIC_CLIENT_ID=apple-client\n\
         TUNESYNC_PROVIDER_APPLE_MUSIC_AUTH_URL=https://music.apple.com/authorize\n\
         TUNESYNC_PROVIDER_APPLE_MUSIC_TOKEN_URL=https://music.apple.com/token\n\
         TUNESYNC_PROVIDER_APPLE_MUSIC_SCOPES=library-read, playlists\n",
    );
    write_env(dir.path(), ".env", &env);

    let config = ConfigLoader::with_base_dir(dir.path().to_path_buf())
        .load()
        .unwrap();
    let apple = config.providers.get("apple_music").unwrap();
    assert_eq!(apple.client_id.as_deref(), Some("apple-client"));
    assert_eq!(
        apple.scopes,
        vec!["library-read".to_string(), "playlists".to_string()]
    );
}

#[test]
fn missing_crypto_key_fails_validation() {
    let dir = tempdir().unwrap();
    write_env(
        dir.path(),
        ".env",
        "TUNESYNC_PROFILE=test\nTUNESYNC_OPERATOR_TOKEN=root-token\n",
    );

    let result = ConfigLoader::with_base_dir(dir.path().to_path_buf()).load();
    assert!(matches!(result, Err(ConfigError::MissingCryptoKey)));
}

#[test]
fn short_crypto_key_fails_validation() {
    let dir = tempdir().unwrap();
    write_env(
        dir.path(),
        ".env",
        "TUNESYNC_PROFILE=test\n\
         TUNESYNC_OPERATOR_TOKEN=root-token\n\
         TUNESYNC_CRYPTO_KEY=c2hvcnQ\n",
    );

    let result = ConfigLoader::with_base_dir(dir.path().to_path_buf()).load();
    assert!(matches!(
        result,
        Err(ConfigError::InvalidCryptoKeyLength { length: 5 })
    ));
}

#[test]
fn provider_without_token_endpoint_fails_validation() {
    let dir = tempdir().unwrap();
    let mut env = base_env();
    env.push_str(
        "TUNESYNC_PROVIDER_SPOTIFY_CLIENT_ID=spotify-client\n\
         TUNESYNC_PROVIDER_SPOTIFY_AUTH_URL=https://accounts.spotify.com/authorize\n",
    );
    write_env(dir.path(), ".env", &env);

    let result = ConfigLoader::with_base_dir(dir.path().to_path_buf()).load();
    assert!(matches!(
        result,
        Err(ConfigError::MissingProviderEndpoint { .. })
    ));
}
