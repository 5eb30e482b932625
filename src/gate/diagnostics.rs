//! One-shot module execution against an extracted bundle, bypassing the
//! persistent length-prefixed gate protocol in [`super::protocol`].
//!
//! The entry stub packed into every bundle answers to two invocations: the
//! `--stream` mode [`super::GateManager`] launches for a real run, and a
//! `--run <fqcn>` mode that takes one module's params on stdin, executes it
//! once, and prints a single JSON result to stdout before exiting. This is
//! the second half of that contract: extract the archive and run the stub
//! in `--run` mode directly, with no gate process kept alive afterward.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::bundle::{self, Bundle};
use crate::error::{Error, ErrorContext, Result};
use crate::traits::Transport;

/// Extract `bundle` into `dest_dir` and run `fqcn` once via
/// `diagnostic_command`, returning whatever JSON the stub printed.
///
/// `diagnostic_command` is a shell fragment (e.g. `"python3 entrypoint.py
/// --run"`); `fqcn` is appended as its final argument.
pub async fn run_once(
    transport: &Arc<dyn Transport>,
    bundle: &Bundle,
    dest_dir: &Path,
    diagnostic_command: &str,
    fqcn: &str,
    params: Value,
) -> Result<Value> {
    bundle::extract(&bundle.path, dest_dir)?;

    let command = format!("cd {} && {diagnostic_command} {fqcn}", dest_dir.display());
    let mut channel = transport.launch(&command).await?;

    let input = serde_json::to_vec(&params).context("serializing diagnostic run params")?;
    channel.write_all(&input).await.map_err(Error::Io)?;
    channel.shutdown().await.map_err(Error::Io)?;

    let mut output = Vec::new();
    channel.read_to_end(&mut output).await.map_err(Error::Io)?;

    serde_json::from_slice(&output).map_err(|e| Error::Other {
        message: format!("diagnostic run of '{fqcn}' on {} produced invalid JSON: {e}", transport.host()),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LocalTransport;

    fn make_bundle(dir: &Path) -> Bundle {
        let archive = dir.join("bundle.tar.gz");
        let encoder = flate2::write::GzEncoder::new(std::fs::File::create(&archive).unwrap(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let contents = b"print('hi')\n";
        let mut header = tar::Header::new_gnu();
        header.set_path("modules/ftl2/builtin/diag").unwrap();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &contents[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        Bundle {
            fingerprint: "deadbeef".to_string(),
            path: archive,
        }
    }

    #[tokio::test]
    async fn extracts_and_runs_the_stub_once() {
        let dir = tempfile::tempdir().unwrap();
        let extract_dir = dir.path().join("extracted");
        let bundle = make_bundle(dir.path());

        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new("localhost"));
        // No real python stub in tests; echo a canned result instead, and
        // confirm separately that the module file actually landed where
        // `--run` would look for it.
        let result = run_once(
            &transport,
            &bundle,
            &extract_dir,
            "printf '{\"success\":true,\"changed\":false,\"output\":\"ran\"}' #",
            "ftl2.builtin.diag",
            serde_json::json!({}),
        )
        .await
        .unwrap();

        assert_eq!(result["success"], Value::Bool(true));
        assert_eq!(result["output"], Value::String("ran".to_string()));
        assert!(extract_dir.join("modules/ftl2/builtin/diag").is_file());
    }

    #[tokio::test]
    async fn invalid_stub_output_is_a_clear_error() {
        let dir = tempfile::tempdir().unwrap();
        let extract_dir = dir.path().join("extracted");
        let bundle = make_bundle(dir.path());

        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new("localhost"));
        let result = run_once(&transport, &bundle, &extract_dir, "printf 'not json' #", "ftl2.builtin.diag", serde_json::json!({})).await;

        assert!(result.is_err());
    }
}
