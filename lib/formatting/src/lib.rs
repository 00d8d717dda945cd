use serror::Serror;

/// Render an error chain for structured log entries:
/// the top-level error followed by its numbered context trace.
pub fn format_serror(Serror { error, trace }: &Serror) -> String {
  if trace.is_empty() {
    return format!("ERROR: {error}");
  }
  let mut out = format!("ERROR: {error}\n\nTRACE:");
  for (i, msg) in trace.iter().enumerate() {
    out.push_str(&format!("\n\t{}: {msg}", i + 1));
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_trace_in_order() {
    let error: anyhow::Error = anyhow::anyhow!("root cause")
      .context("middle")
      .context("top");
    let out = format_serror(&error.into());
    assert!(out.starts_with("ERROR: top"));
    let middle = out.find("1: middle").unwrap();
    let root = out.find("2: root cause").unwrap();
    assert!(middle < root);
  }

  #[test]
  fn no_trace_for_plain_errors() {
    let error: anyhow::Error = anyhow::anyhow!("just this");
    assert_eq!(format_serror(&error.into()), "ERROR: just this");
  }
}
