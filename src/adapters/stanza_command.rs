//! pgBackRest `stanza-create` invocation
//!
//! The command first checks that the config hash mounted into the container
//! matches the hash the controller just computed. A mismatch means the new
//! configuration has not reached the container yet and is reported on stderr
//! with [`CONFIG_HASH_MISMATCH`].

use crate::naming;

use super::pgbackrest_config::{CM_CONFIG_HASH_KEY, CONFIG_MOUNT_PATH};

/// Exact stderr output of the command when the config hashes differ
pub const CONFIG_HASH_MISMATCH: &str = "postgres operator error: pgBackRest config hash mismatch";

/// Build the `stanza-create` command for the given config hash
pub fn stanza_create_command(config_hash: &str) -> Vec<String> {
    let script = format!(
        r#"
declare -r hash="$1" stanza="$2" message="$3"
if [[ "$(< {dir}/{key})" != "${{hash}}" ]]; then
    printf >&2 "%s" "${{message}}"; exit 1
fi
pgbackrest stanza-create --stanza="${{stanza}}"
"#,
        dir = CONFIG_MOUNT_PATH,
        key = CM_CONFIG_HASH_KEY,
    );

    vec![
        "bash".to_string(),
        "-ceu".to_string(),
        "--".to_string(),
        script,
        "-".to_string(),
        config_hash.to_string(),
        naming::STANZA.to_string(),
        CONFIG_HASH_MISMATCH.to_string(),
    ]
}

/// Whether the command's stderr reports a config hash mismatch
pub fn is_config_hash_mismatch(stderr: &str) -> bool {
    stderr == CONFIG_HASH_MISMATCH
}
