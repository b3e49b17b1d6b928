//! CLI output helpers.
//!
//! Every command speaks two dialects: plain text for humans and one JSON
//! object per invocation for `--json`. Errors always carry the operation
//! name, the stable error kind, and the recovery hint when one exists.

use serde_json::json;

use super::errors::CliError;

/// Emit a command's JSON result on stdout.
pub fn write_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Success envelope for `--json`.
pub fn ok_envelope(operation: &str, body: serde_json::Value) -> serde_json::Value {
    let mut envelope = json!({
        "operation": operation,
        "status": "ok",
    });
    if let (Some(obj), Some(body)) = (envelope.as_object_mut(), body.as_object()) {
        for (k, v) in body {
            obj.insert(k.clone(), v.clone());
        }
    }
    envelope
}

/// Error envelope for `--json`, written to stderr.
pub fn write_error(operation: &str, error: &CliError, json_mode: bool) {
    if json_mode {
        let envelope = json!({
            "operation": operation,
            "status": "error",
            "error": {
                "kind": error.kind(),
                "message": error.to_string(),
                "hint": error.recovery_hint(),
            },
        });
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&envelope).unwrap_or_default()
        );
    } else {
        eprintln!("dsg {}: {}", operation, error);
        if let Some(hint) = error.recovery_hint() {
            eprintln!("  hint: {}", hint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DsgError;

    #[test]
    fn test_ok_envelope_merges_body() {
        let envelope = ok_envelope("sync", json!({"snapshot_id": "s3", "uploads": 2}));
        assert_eq!(envelope["operation"], "sync");
        assert_eq!(envelope["status"], "ok");
        assert_eq!(envelope["snapshot_id"], "s3");
        assert_eq!(envelope["uploads"], 2);
    }

    #[test]
    fn test_error_kind_visible_in_envelope() {
        let err: CliError = DsgError::sync_with_hint("conflicts", "annotate conflicts.txt").into();
        // Shape check only; write_error prints to stderr.
        assert_eq!(err.kind(), "DSG_SYNC");
        assert_eq!(err.recovery_hint(), Some("annotate conflicts.txt"));
    }
}
