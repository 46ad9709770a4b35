use {
  heap_monitor::{Frame, Monitor, MonitorConfig, NoCapture, host::ManagedHeap},
  std::{io, process::ExitCode},
  tracing_subscriber::EnvFilter,
};

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let defaults = MonitorConfig::default()
    .with_sampling_interval(1024)
    .with_seed(48);

  let config = match defaults.with_env_overrides() {
    Ok(config) => config,
    Err(err) => {
      eprintln!("error: {err}");
      return ExitCode::FAILURE;
    }
  };

  let monitor = Monitor::builder()
    .with_config(config)
    .capture(NoCapture)
    .finish();

  let heap = ManagedHeap::new().with_background_collector();
  heap.attach(&monitor);

  println!("=== heap monitor gc demo ===");
  println!("storage empty: {}", monitor.event_storage_is_empty());

  monitor.enable_sampling_events();

  let main_frame =
    Frame::new("main", "([Ljava/lang/String;)V", "HeapMonitorGCTest.java", 48);

  let kept = heap.allocate(vec![0u8; 4096], 64 * 1024, &[main_frame.clone()]);

  let mut frames = heap.allocate_garbage(64 * 1024, &[main_frame.clone()]);
  frames.push(main_frame);

  println!("obtained events: {}", monitor.obtained_events(&frames));
  println!("garbage before gc: {}", monitor.garbage_contains(&frames));

  match monitor.force_garbage_collection(&heap) {
    Ok(report) => println!(
      "cycle {} examined={} newly_garbage={}",
      report.cycle, report.examined, report.newly_garbage
    ),
    Err(err) => {
      eprintln!("error: {err}");
      return ExitCode::FAILURE;
    }
  }

  println!("garbage after gc: {}", monitor.garbage_contains(&frames));
  println!("kept object {} still alive: {} bytes", kept.object(), kept.len());

  monitor.disable_sampling_events();

  if let Err(err) = monitor.snapshot().export_json(io::stdout().lock()) {
    eprintln!("error: {err}");
    return ExitCode::FAILURE;
  }

  println!();

  ExitCode::SUCCESS
}
