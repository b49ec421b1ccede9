//! Realtime playback through the default output device

use std::time::{Duration, Instant};

use anyhow::Result;
use audional_core::{PlayMode, ProjectState};
use audional_services::{EngineConfig, RealtimeBackend, SampleBank, TransportScheduler};
use crossbeam_channel::{after, select, tick};
use tracing::{debug, info};

/// Play for `seconds` of transport time, polling the scheduler on the
/// configured interval.
pub fn run(
    backend: RealtimeBackend,
    project: ProjectState,
    samples: SampleBank,
    config: EngineConfig,
    mode: PlayMode,
    seconds: f64,
) -> Result<()> {
    let poll_interval = config.poll_interval;
    let start_delay = config.start_delay;
    if !config.covers_poll_interval() {
        tracing::warn!(
            lookahead = config.lookahead,
            poll_ms = poll_interval.as_millis() as u64,
            "Lookahead is shorter than the poll interval, steps may arrive late"
        );
    }

    let mut scheduler = TransportScheduler::new(backend, project, samples, config);
    let bound = crate::session::bind_instruments(&mut scheduler);
    let events = scheduler.subscribe();
    scheduler.start(mode)?;
    info!(seconds, instruments = bound, "Playing");

    let ticker = tick(poll_interval);
    let deadline = after(Duration::from_secs_f64(seconds + start_delay));
    let started = Instant::now();
    let mut last_step = None;

    loop {
        select! {
            recv(ticker) -> _ => {
                scheduler.poll();
                let position = scheduler.position();
                if position.step != last_step {
                    last_step = position.step;
                    debug!(position = %position.format(), cycle = position.cycle, "Step");
                }
            }
            recv(events) -> event => {
                if let Ok(event) = event {
                    info!(event = event.name(), "Transport event");
                }
            }
            recv(deadline) -> _ => break,
        }
    }

    debug!(
        elapsed = started.elapsed().as_secs_f64(),
        diagnostics = ?scheduler.diagnostics(),
        "Playback finished"
    );
    scheduler.teardown();
    while let Ok(event) = events.try_recv() {
        info!(event = event.name(), "Transport event");
    }
    scheduler.backend_mut().close();
    Ok(())
}
