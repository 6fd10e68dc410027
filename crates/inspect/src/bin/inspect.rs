use {
    anyhow::Context,
    base::log,
    inspect::{JsonlRecorder, NullRecorder, Recorder, Session, SessionConfig, SessionEvent},
    std::sync::Arc,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: inspect <config.json>")?;
    let config = SessionConfig::load(&path).with_context(|| format!("loading {}", path))?;

    let level = config.level_filter()?;
    match config.log_dir() {
        Some(dir) => base::init_file_logger(dir, level)
            .with_context(|| format!("opening log directory {}", dir.display()))?,
        None => base::init_stdout_logger(level),
    }

    let recorder: Arc<dyn Recorder> = match config.record_dir() {
        Some(dir) => Arc::new(JsonlRecorder::new(dir)?),
        None => Arc::new(NullRecorder),
    };
    let provider = Arc::new(config.simulation().provider());

    log::info!("starting session with {} cameras", config.cameras().len());
    let (session, mut events) = Session::builder(config, provider)
        .with_recorder(recorder)
        .start()
        .await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Configured { camera, applied, .. }) => {
                    if !applied.clamped.is_empty() {
                        log::info!("camera {}: clamped {:?}", camera, applied.clamped);
                    }
                }
                Some(SessionEvent::DeviceUnavailable { camera, reason, .. }) => {
                    log::warn!("camera {} unavailable: {}", camera, reason);
                }
                Some(SessionEvent::Result { slot, camera, sequence, is_defect, score_text, .. }) => {
                    let verdict = if is_defect { "DEFECT" } else { "GOOD" };
                    log::info!("slot {} camera {} frame {}: {} ({})", slot, camera, sequence, verdict, score_text);
                }
                Some(SessionEvent::Alert { kind, camera: Some(camera), message }) => {
                    log::warn!("camera {}: {}: {}", camera, kind, message);
                }
                Some(SessionEvent::Alert { kind, camera: None, message }) => {
                    log::warn!("{}: {}", kind, message);
                }
                Some(SessionEvent::Cycle(state)) => {
                    log::info!(
                        "cycle {}: {} good, {} bad, {} queued",
                        state.cycle_count,
                        state.good_count,
                        state.bad_count,
                        session.queue_depth()
                    );
                }
                Some(SessionEvent::CaptureFinished { stopped }) => {
                    log::info!("capture finished (stopped: {})", stopped);
                    break;
                }
                Some(_) => {}
                None => break,
            },
            _ = &mut ctrl_c => {
                log::info!("interrupted, stopping");
                break;
            }
        }
    }

    let state = session.shutdown(true).await?;
    println!(
        "good: {}, bad: {}, cycles: {}",
        state.good_count, state.bad_count, state.cycle_count
    );
    Ok(())
}
