//! Periodic characteristic polling
//! One cancellable task per poll group, grouped under the connect attempt's session id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::events::EventEmitter;
use crate::core::bluetooth::link::Link;
use crate::core::bluetooth::types::SessionEvent;
use crate::core::registry::{ChannelDescriptor, DeviceFamily, PollGroup};
use crate::core::telemetry::TelemetryCache;
use crate::error::SessionError;
use crate::storage::TelemetryRecorder;

/// Channels read together at one cadence
#[derive(Debug, Clone)]
pub struct PollJob {
    pub group: PollGroup,
    pub interval: Duration,
    pub channels: Vec<&'static ChannelDescriptor>,
}

/// Where poll results go
#[derive(Clone)]
pub struct PollContext {
    pub family: DeviceFamily,
    pub link: Arc<Link>,
    pub cache: Arc<TelemetryCache>,
    pub emitter: EventEmitter,
    pub recorder: Option<Arc<TelemetryRecorder>>,
}

struct ScheduledSession {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
pub struct PollScheduler {
    sessions: HashMap<u64, ScheduledSession>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns one task per job with at least one channel.
    pub fn start(&mut self, session_id: u64, jobs: Vec<PollJob>, context: PollContext) {
        if self.sessions.contains_key(&session_id) {
            warn!("Polling for session {} is already running", session_id);
            return;
        }

        let token = CancellationToken::new();
        let handles = jobs
            .into_iter()
            .filter(|job| !job.channels.is_empty())
            .map(|job| tokio::spawn(run_job(job, context.clone(), token.clone())))
            .collect();
        self.sessions.insert(session_id, ScheduledSession { token, handles });
        info!("Started polling for session {}", session_id);
    }

    /// Stops every task of the session and waits for them to exit.
    ///
    /// Returns false when nothing was scheduled under `session_id`.
    pub async fn cancel(&mut self, session_id: u64) -> bool {
        let Some(session) = self.sessions.remove(&session_id) else {
            return false;
        };
        session.token.cancel();
        for handle in session.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Poll task for session {} ended abnormally: {:?}", session_id, e);
                }
            }
        }
        info!("Stopped polling for session {}", session_id);
        true
    }
}

async fn run_job(job: PollJob, context: PollContext, token: CancellationToken) {
    debug!(
        "{:?} poll every {:?} for {}: {:?}",
        job.group,
        job.interval,
        context.link.peripheral_id(),
        job.channels.iter().map(|c| c.name).collect::<Vec<_>>()
    );
    // First tick fires at once so every group has values right after connect.
    let mut ticker = tokio::time::interval(job.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !poll_once(&job, &context, &token).await {
            break;
        }
    }
    debug!("{:?} poll task stopped", job.group);
}

/// Reads every channel of the job once. Returns false once cancelled.
async fn poll_once(job: &PollJob, context: &PollContext, token: &CancellationToken) -> bool {
    let mut published = 0;
    for &channel in &job.channels {
        let result = tokio::select! {
            _ = token.cancelled() => return false,
            result = context.link.read(channel) => result,
        };
        if token.is_cancelled() {
            debug!("Discarding {} read completed after cancellation", channel.name);
            return false;
        }

        match result
            .map_err(SessionError::from)
            .and_then(|payload| Ok(context.cache.ingest(channel, &payload)?))
        {
            Ok(reading) => {
                context.emitter.emit(SessionEvent::Reading { reading });
                published += 1;
            }
            Err(e) => {
                warn!("Polling {} failed: {}", channel.name, e);
                context.emitter.emit(SessionEvent::PollFailed {
                    family: context.family,
                    channel: channel.name,
                    error: e.to_string(),
                });
            }
        }
    }

    if job.group == PollGroup::Primary && published > 0 {
        if let Some(recorder) = &context.recorder {
            if let Err(e) = recorder.record(context.family, &context.cache).await {
                warn!("Failed to record telemetry sample: {}", e);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::MockTransport;
    use crate::core::bluetooth::transport::Transport;
    use crate::core::registry::{
        self, COR_POWER_VOLTAGE_CHAR, COR_SERVICE, COR_SOC_CHAR, COR_TEMPERATURE_CHAR,
    };
    use crate::storage::{MemorySink, StaticIdentity};

    async fn context(
        transport: &Arc<MockTransport>,
        recorder: Option<Arc<TelemetryRecorder>>,
    ) -> PollContext {
        transport.connect("cor-1").await.unwrap();
        PollContext {
            family: DeviceFamily::Cor,
            link: Arc::new(Link::new(transport.clone(), "cor-1", Duration::from_secs(2))),
            cache: Arc::new(TelemetryCache::new(DeviceFamily::Cor)),
            emitter: EventEmitter::new(64),
            recorder,
        }
    }

    fn primary_job() -> PollJob {
        PollJob {
            group: PollGroup::Primary,
            interval: Duration::from_secs(2),
            channels: registry::channels_in(DeviceFamily::Cor, PollGroup::Primary).collect(),
        }
    }

    fn cor_transport() -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new()
                .with_advertisement("cor-1", "COR2 Hub", -50)
                .with_payload(COR_SERVICE, COR_SOC_CHAR, &[0, 1, 0, 80, 0, 0, 0, 0, 0, 0])
                .with_payload(COR_SERVICE, COR_POWER_VOLTAGE_CHAR, &[0, 1, 0x04, 0xB0, 0xFF, 0x9C])
                .with_payload(COR_SERVICE, COR_TEMPERATURE_CHAR, &[0, 1, 21, 30, 0, 0, 0, 0, 0, 0]),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_tick_publishes_and_records() {
        let transport = cor_transport();
        let sink = Arc::new(MemorySink::new());
        let recorder = Arc::new(TelemetryRecorder::new(
            sink.clone(),
            Arc::new(StaticIdentity::new(Some("owner-1".to_string()))),
        ));
        let context = context(&transport, Some(recorder)).await;
        let mut events = context.emitter.subscribe();
        let cache = context.cache.clone();

        let mut scheduler = PollScheduler::new();
        scheduler.start(7, vec![primary_job()], context);

        let mut channels = Vec::new();
        while channels.len() < 3 {
            if let SessionEvent::Reading { reading } = events.recv().await.unwrap() {
                channels.push(reading.channel);
            }
        }
        assert_eq!(channels, vec!["soc", "power_voltage", "temperature"]);
        assert_eq!(cache.value("power_voltage", "power"), Some(-100.0));

        assert!(scheduler.cancel(7).await);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].power, -100.0);
        assert_eq!(records[0].voltage, 1200.0);
        assert_eq!(records[0].temperature1, 21.0);
        assert_eq!(records[0].temperature2, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_group_reads_right_away() {
        let transport = cor_transport();
        let context = context(&transport, None).await;
        let mut events = context.emitter.subscribe();
        let started = tokio::time::Instant::now();

        let mut scheduler = PollScheduler::new();
        let slow = PollJob {
            group: PollGroup::Slow,
            interval: Duration::from_secs(29),
            channels: vec![registry::lookup(DeviceFamily::Cor, "power_voltage").unwrap()],
        };
        scheduler.start(5, vec![slow], context);

        match events.recv().await.unwrap() {
            SessionEvent::Reading { reading } => assert_eq!(reading.channel, "power_voltage"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        scheduler.cancel(5).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_channel_does_not_stop_polling() {
        let transport = cor_transport();
        transport.fail_reads_of(COR_SOC_CHAR);
        let context = context(&transport, None).await;
        let mut events = context.emitter.subscribe();

        let mut scheduler = PollScheduler::new();
        scheduler.start(1, vec![primary_job()], context);

        let mut failures = 0;
        let mut readings = 0;
        while readings < 4 {
            match events.recv().await.unwrap() {
                SessionEvent::PollFailed { channel, .. } => {
                    assert_eq!(channel, "soc");
                    failures += 1;
                }
                SessionEvent::Reading { .. } => readings += 1,
                _ => {}
            }
        }
        assert_eq!(failures, 2);
        scheduler.cancel(1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_in_flight_read() {
        let transport = cor_transport();
        transport.set_read_delay(Duration::from_millis(1500));
        let context = context(&transport, None).await;
        let mut events = context.emitter.subscribe();

        let mut scheduler = PollScheduler::new();
        scheduler.start(3, vec![primary_job()], context);

        // First reading lands at 1.5s; the next read is then in flight.
        loop {
            if let SessionEvent::Reading { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(scheduler.cancel(3).await);
        let reads = transport.read_count();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.read_count(), reads);
        assert!(events.try_recv().is_err());
        assert!(!scheduler.cancel(3).await);
    }
}
