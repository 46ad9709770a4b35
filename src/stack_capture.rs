use super::*;

/// Captures the call stack of the allocating thread.
///
/// Implementations return frames innermost first and must not return more
/// than `max_depth` frames.
pub trait StackCapture: Send + Sync {
  fn capture(&self, max_depth: usize) -> Vec<Frame>;
}

/// Capture that records nothing; sampled events get a single `<unknown>`
/// frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl StackCapture for NoCapture {
  fn capture(&self, _max_depth: usize) -> Vec<Frame> {
    Vec::new()
  }
}

/// Captures native frames through the `backtrace` crate.
#[derive(Debug, Clone)]
pub struct BacktraceCapture {
  skip_frames: usize,
}

impl Default for BacktraceCapture {
  fn default() -> Self {
    Self::new(0)
  }
}

impl BacktraceCapture {
  #[must_use]
  pub fn new(skip_frames: usize) -> Self {
    Self { skip_frames }
  }
}

impl StackCapture for BacktraceCapture {
  fn capture(&self, max_depth: usize) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(max_depth);
    let mut leading = true;
    let mut remaining_skip = self.skip_frames;

    backtrace::trace(|frame| {
      if frames.len() >= max_depth {
        return false;
      }

      let frame = extract_frame(frame);

      if leading && is_monitor_frame(&frame.name) {
        return true;
      }

      leading = false;

      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      frames.push(frame);
      true
    });

    frames
  }
}

/// Innermost frames that belong to the unwinder or to the monitor's own
/// allocation path rather than to the allocating code.
const MONITOR_FRAME_PREFIXES: &[&str] = &[
  "backtrace::",
  "_Unwind_",
  "<heap_monitor::stack_capture::BacktraceCapture as ",
  "heap_monitor::state::Monitor::on_allocation",
];

fn is_monitor_frame(name: &str) -> bool {
  MONITOR_FRAME_PREFIXES
    .iter()
    .any(|prefix| name.starts_with(prefix))
}

/// Trim captured frames to the configured depth, substituting a placeholder
/// when nothing was captured.
pub(crate) fn normalize(
  mut frames: Vec<Frame>,
  max_depth: usize,
) -> Vec<Frame> {
  frames.truncate(max_depth.max(1));

  if frames.is_empty() {
    frames.push(Frame::unknown());
  }

  frames
}

fn extract_frame(frame: &backtrace::Frame) -> Frame {
  let mut filename = None;
  let mut function = None;
  let mut lineno = None;

  backtrace::resolve_frame(frame, |symbol| {
    if filename.is_none() {
      filename = symbol
        .filename()
        .and_then(path_to_string)
        .map(str::to_string);
    }

    if function.is_none() {
      function = symbol.name().map(|name| symbol_name_to_string(&name));
    }

    if lineno.is_none() {
      lineno = symbol.lineno();
    }
  });

  Frame::new(
    function.unwrap_or_else(|| "<unknown>".to_string()),
    "",
    filename.unwrap_or_else(|| "<native>".to_string()),
    lineno.unwrap_or(0),
  )
}

fn path_to_string(path: &std::path::Path) -> Option<&str> {
  path
    .to_str()
    .or_else(|| path.file_name().and_then(OsStr::to_str))
}

fn symbol_name_to_string(name: &SymbolName<'_>) -> String {
  format!("{name:#}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backtrace_capture_respects_depth() {
    let frames = BacktraceCapture::default().capture(3);

    assert!(frames.len() <= 3);
    assert!(!frames.is_empty());
  }

  #[test]
  fn capture_starts_at_the_calling_function() {
    let frames = BacktraceCapture::default().capture(2);

    assert!(
      frames[0]
        .name
        .ends_with("capture_starts_at_the_calling_function"),
      "{frames:?}"
    );
    assert!(frames.iter().all(|frame| frame.signature.is_empty()));
  }

  #[test]
  fn skip_frames_apply_past_the_monitor_frames() {
    let direct = BacktraceCapture::default().capture(8);
    let skipped = BacktraceCapture::new(1).capture(8);

    assert_eq!(skipped[0].name, direct[1].name);
  }

  #[test]
  fn recognizes_monitor_frames() {
    assert!(is_monitor_frame("backtrace::backtrace::libunwind::trace"));
    assert!(is_monitor_frame("heap_monitor::state::Monitor::on_allocation"));
    assert!(is_monitor_frame(
      "<heap_monitor::stack_capture::BacktraceCapture as \
       heap_monitor::stack_capture::StackCapture>::capture"
    ));
    assert!(!is_monitor_frame("heap_monitor::state::tests::allocation_site"));
    assert!(!is_monitor_frame("app::allocate"));
  }

  #[test]
  fn normalize_falls_back_to_unknown() {
    let frames = normalize(NoCapture.capture(4), 4);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].name.as_ref(), "<unknown>");
  }

  #[test]
  fn normalize_truncates_to_depth() {
    let frames = (0..10)
      .map(|line| Frame::new("f", "()V", "F.java", line))
      .collect::<Vec<_>>();

    let frames = normalize(frames, 4);

    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0].line, 0);
  }
}
