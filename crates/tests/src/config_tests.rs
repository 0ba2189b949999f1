use nimbus_config::Settings;

// Environment mutation is process-global, so everything lives in one test.
#[test]
fn documented_env_overrides_apply() {
    std::env::set_var("CLOUDSTORAGE_TEMPORARY_DIR", "/custom/tmp");
    std::env::set_var("CLOUDSTORAGE_HTTP_PORT", "9123");
    std::env::set_var("CLOUDSTORAGE_REDIRECT_URI", "http://example.local:9123");

    let settings = Settings::load().unwrap();
    assert_eq!(settings.storage.temporary_dir, "/custom/tmp");
    assert_eq!(settings.daemon.port, 9123);
    assert_eq!(settings.redirect_uri(), "http://example.local:9123");

    let hints = settings.hints_for("s3");
    assert_eq!(hints.get("aws_region").map(String::as_str), Some("us-east-1"));
    assert_eq!(
        hints.get("redirect_uri").map(String::as_str),
        Some("http://example.local:9123")
    );
    assert_eq!(
        hints.get("temporary_directory").map(String::as_str),
        Some("/custom/tmp")
    );

    std::env::remove_var("CLOUDSTORAGE_TEMPORARY_DIR");
    std::env::remove_var("CLOUDSTORAGE_HTTP_PORT");
    std::env::remove_var("CLOUDSTORAGE_REDIRECT_URI");

    let defaults = Settings::load().unwrap();
    assert_ne!(defaults.storage.temporary_dir, "/custom/tmp");
}
