use super::*;

#[test]
fn expands_tilde_to_home_watch_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/Mirror", &home),
        PathBuf::from("/tmp/home-user/Mirror")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(
        expand_with_home("/var/mirror", &home),
        PathBuf::from("/var/mirror")
    );
}

#[test]
fn reads_intervals_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
}

#[test]
fn watcher_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", true));
}
