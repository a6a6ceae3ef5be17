//! Shell scripts standing in for the daemon executable.
//!
//! Each script records its argument vector and `NGROK_API_KEY` next to
//! itself (`<script>.args`, `<script>.env`) so tests can assert on how the
//! supervisor invoked it.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const RECORD_INVOCATION: &str = r#"printf '%s\n' "$@" > "$0.args"
printf '%s' "${NGROK_API_KEY:-}" > "$0.env"
"#;

/// Startup lines announcing `api_addr` and both readiness events.
pub(crate) fn startup_lines(api_addr: &str) -> String {
    format!(
        r#"echo 't=2024-05-01T10:00:00+0000 lvl=info msg="no configuration paths supplied"'
echo 't=2024-05-01T10:00:00+0000 lvl=info msg="starting web service" obj=web addr={api_addr}'
echo 't=2024-05-01T10:00:01+0000 lvl=info msg="tunnel session started" obj=tunnels.session'
echo 't=2024-05-01T10:00:01+0000 lvl=info msg="client session established" obj=csess id=7f1e'
"#
    )
}

/// A daemon that starts cleanly and then idles until killed.
pub(crate) fn healthy(api_addr: &str) -> String {
    format!("{}exec sleep 30\n", startup_lines(api_addr))
}

/// A daemon that keeps logging after startup.
pub(crate) fn chatty(api_addr: &str, extra_lines: u32) -> String {
    format!(
        r#"{}i=0
while [ "$i" -lt {extra_lines} ]; do
  echo "lvl=info msg=\"heartbeat $i\" obj=heartbeat"
  i=$((i + 1))
done
exec sleep 30
"#,
        startup_lines(api_addr)
    )
}

/// A daemon that logs a heartbeat every 50 ms until killed.
pub(crate) fn ticking(api_addr: &str) -> String {
    format!(
        r#"{}while true; do
  echo 'lvl=info msg=tick obj=heartbeat'
  sleep 0.05
done
"#,
        startup_lines(api_addr)
    )
}

/// A daemon that starts cleanly and exits on its own shortly after.
pub(crate) fn exits_after_startup(api_addr: &str) -> String {
    format!("{}sleep 0.3\nexit 0\n", startup_lines(api_addr))
}

/// A daemon that reports a fatal error and then idles.
pub(crate) fn failing(err: &str) -> String {
    format!(
        r#"echo 'lvl=info msg="open config file" path=/tmp/ngrok.yml'
echo 'lvl=eror msg="failed to start tunnel session" err="{err}"'
exec sleep 30
"#
    )
}

/// A daemon that exits before announcing anything.
pub(crate) fn exits_immediately() -> String {
    "echo 'lvl=info msg=\"shutting down\"'\nexit 1\n".to_owned()
}

/// A daemon that stays silent, forcing the startup deadline.
pub(crate) fn silent() -> String {
    "exec sleep 30\n".to_owned()
}

/// Emulates the administrative subcommands.
pub(crate) fn admin() -> String {
    r#"case "$1" in
  --version) echo "ngrok version 3.5.0" ;;
  config)
    case "$2" in
      add-authtoken) echo "Authtoken saved to configuration file: /tmp/ngrok.yml" ;;
      add-api-key) echo "API key saved to configuration file: /tmp/ngrok.yml" ;;
    esac ;;
  authtoken) echo "Authtoken saved to configuration file: /tmp/ngrok.yml" ;;
  update) echo "No update available, this is the latest version." ;;
  api)
    echo "Fetching resource"
    echo '{"endpoints":[],"uri":"https://api.ngrok.com/endpoints"}' ;;
  fail) echo "boom" >&2; exit 3 ;;
esac
"#
    .to_owned()
}

/// Writes `body` as an executable script at `dir/name`.
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    let script = format!("#!/bin/sh\n{RECORD_INVOCATION}{body}");
    fs::write(&path, script).with_context(|| format!("write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(path)
}

/// Arguments the script at `path` was last invoked with.
pub(crate) fn recorded_args(path: &Path) -> Result<Vec<String>> {
    let args_path = PathBuf::from(format!("{}.args", path.display()));
    let text = fs::read_to_string(&args_path)
        .with_context(|| format!("read {}", args_path.display()))?;
    Ok(text.lines().map(str::to_owned).collect())
}

/// `NGROK_API_KEY` as seen by the script at `path`.
pub(crate) fn recorded_api_key(path: &Path) -> Result<String> {
    let env_path = PathBuf::from(format!("{}.env", path.display()));
    fs::read_to_string(&env_path).with_context(|| format!("read {}", env_path.display()))
}
