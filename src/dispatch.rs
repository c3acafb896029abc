//! # Dispatch Module
//!
//! The always-on loop between the serial link and the station subsystems.
//!
//! ```text
//!            no bytes pending
//!           +---------------+
//!           v               |
//!         Idle -------------+
//!           |  bytes pending          interrupt
//!           v                       (any state)
//!      Dispatching --> Idle             |
//!                                       v
//!                                 ShuttingDown --> transport closed, exit 130
//! ```
//!
//! Nothing that goes wrong inside one iteration is allowed to end the loop:
//! malformed lines, rejected samples, predictor failures and link errors are
//! logged and counted, and control returns to `Idle`.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time;

use crate::command::{Command, StationSample};
use crate::config::Config;
use crate::dataset::{DatasetRouter, DatasetRow};
use crate::error::{ParseError, TransportError};
use crate::forecast::{Clock, Forecast, ForecastSender, SystemClock};
use crate::predictor::{Predictor, SubprocessPredictor};
use crate::serial::Transport;

/// Exit status for an interactive interrupt.
pub const INTERRUPT_EXIT_CODE: u8 = 130;

/// Dispatch loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Dispatching,
    ShuttingDown,
}

/// How the loop ended. Interrupt is the only way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Interrupted,
}

impl ExitReason {
    pub fn exit_code(self) -> u8 {
        match self {
            ExitReason::Interrupted => INTERRUPT_EXIT_CODE,
        }
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was pending, or the read timed out.
    Idle,
    /// A line was read and dispatched.
    Dispatched,
    /// The link failed; retried on the next iteration.
    TransportFault,
}

/// Counters reported on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub appended: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub forecast_runs: u64,
    pub records_sent: u64,
    pub predictor_failures: u64,
    pub transport_errors: u64,
}

/// Everything the loop acts on, threaded explicitly instead of held in globals.
pub struct BaseStation<P> {
    router: DatasetRouter,
    predictor: P,
    sender: ForecastSender,
    clock: Box<dyn Clock>,
    poll_interval: Duration,
    alert_threshold: u32,
}

impl BaseStation<SubprocessPredictor> {
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            DatasetRouter::new(&config.dataset_dir),
            SubprocessPredictor::from_config(config),
        )
        .with_poll_interval(config.poll_interval())
        .with_alert_threshold(config.transport_alert_threshold)
    }
}

impl<P: Predictor> BaseStation<P> {
    pub fn new(router: DatasetRouter, predictor: P) -> Self {
        Self {
            router,
            predictor,
            sender: ForecastSender,
            clock: Box::new(SystemClock),
            poll_interval: Duration::from_millis(50),
            alert_threshold: 5,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_alert_threshold(mut self, alert_threshold: u32) -> Self {
        self.alert_threshold = alert_threshold.max(1);
        self
    }

    pub fn router(&self) -> &DatasetRouter {
        &self.router
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }
}

/// Owns the transport for its whole lifetime.
pub struct DispatchLoop<T, P> {
    transport: T,
    station: BaseStation<P>,
    state: LoopState,
    stats: DispatchStats,
    failure_streak: u32,
}

impl<T: Transport, P: Predictor> DispatchLoop<T, P> {
    pub fn new(transport: T, station: BaseStation<P>) -> Self {
        Self {
            transport,
            station,
            state: LoopState::Idle,
            stats: DispatchStats::default(),
            failure_streak: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn station(&self) -> &BaseStation<P> {
        &self.station
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Consecutive transport failures since the link last worked.
    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    /// Polls until `shutdown` turns true, then closes the transport.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
        info!("Dispatch loop running");
        while !*shutdown.borrow() {
            match self.tick().await {
                Tick::Dispatched => {}
                Tick::Idle | Tick::TransportFault => {
                    self.wait(&mut shutdown).await;
                }
            }
        }
        self.shutdown().await
    }

    /// Sleeps for one poll interval, waking early on shutdown.
    async fn wait(&self, shutdown: &mut watch::Receiver<bool>) {
        let poll_interval = self.station.poll_interval;
        tokio::select! {
            changed = shutdown.changed() => {
                // Sender gone: nobody can ask for shutdown any more, keep polling.
                if changed.is_err() {
                    time::sleep(poll_interval).await;
                }
            }
            () = time::sleep(poll_interval) => {}
        }
    }

    /// One iteration: check for bytes, read a line, dispatch it.
    pub async fn tick(&mut self) -> Tick {
        match self.transport.has_pending_bytes() {
            Ok(false) => {
                self.link_ok();
                return Tick::Idle;
            }
            Ok(true) => {}
            Err(e) => {
                self.link_failed(&e);
                return Tick::TransportFault;
            }
        }

        self.state = LoopState::Dispatching;
        let tick = match self.transport.read_line().await {
            Ok(Some(line)) => {
                self.link_ok();
                self.dispatch_line(&line).await;
                Tick::Dispatched
            }
            Ok(None) => Tick::Idle,
            Err(TransportError::LineTooLong { limit }) => {
                // Not a link failure.
                self.link_ok();
                self.stats.malformed += 1;
                warn!("Malformed command: line longer than {limit} bytes");
                Tick::Dispatched
            }
            Err(e) => {
                self.link_failed(&e);
                Tick::TransportFault
            }
        };
        self.state = LoopState::Idle;
        tick
    }

    /// Parses one line and acts on it.
    pub async fn dispatch_line(&mut self, line: &str) {
        let command = Command::parse(line);
        debug!("Dispatching {} command", command.name());
        match command {
            Command::Run => self.run_forecasts().await,
            Command::Receive(sample) => self.receive(&sample),
            Command::Malformed(ParseError::Empty) => {
                debug!("Malformed command (empty line), skipped");
            }
            Command::Malformed(reason) => {
                // The sender gets no acknowledgement; the log is the only trace.
                self.stats.malformed += 1;
                warn!("Malformed command {:?}: {reason}", line.trim());
            }
        }
    }

    fn receive(&mut self, sample: &StationSample) {
        match self.station.router.append(sample) {
            Ok(dataset) => {
                self.stats.appended += 1;
                debug!(
                    "Appended {} from address {} to station {}",
                    sample.temperature, sample.station_id, dataset.index
                );
            }
            Err(e) => {
                self.stats.dropped += 1;
                error!("Dropped sample from address {}: {e}", sample.station_id);
            }
        }
    }

    async fn run_forecasts(&mut self) {
        self.stats.forecast_runs += 1;
        let stations = match self.station.router.stations() {
            Ok(stations) => stations,
            Err(e) => {
                error!("Cannot enumerate station datasets: {e}");
                return;
            }
        };
        if stations.is_empty() {
            warn!(
                "Run requested but no station datasets exist yet in {}",
                self.station.router.dir().display()
            );
            return;
        }

        info!("Producing forecasts for {} stations", stations.len());
        let issued = self.station.clock.now().date_naive();
        let mut forecasts = Vec::with_capacity(stations.len());
        for dataset in &stations {
            match self.station.router.read_series(dataset.index) {
                Ok(rows) => info!("Station {}: {}", dataset.index, series_summary(&rows)),
                Err(e) => warn!("Cannot read back station {}: {e}", dataset.index),
            }
            match self.station.predictor.produce_forecast(dataset).await {
                Ok(values) => forecasts.push(Forecast::new(dataset.index, values, issued)),
                Err(e) => {
                    self.stats.predictor_failures += 1;
                    error!("Forecast for station {} skipped: {e}", dataset.index);
                }
            }
        }

        for forecast in &forecasts {
            match self.station.sender.send(&mut self.transport, forecast).await {
                Ok(sent) => {
                    self.link_ok();
                    self.stats.records_sent += sent as u64;
                }
                Err(e) => {
                    self.link_failed(&e);
                    error!(
                        "Forecast for station {} not delivered",
                        forecast.station_index
                    );
                }
            }
        }
    }

    fn link_ok(&mut self) {
        if self.failure_streak >= self.station.alert_threshold {
            info!(
                "Serial link recovered after {} consecutive failures",
                self.failure_streak
            );
        }
        self.failure_streak = 0;
    }

    fn link_failed(&mut self, e: &TransportError) {
        self.stats.transport_errors += 1;
        self.failure_streak = self.failure_streak.saturating_add(1);
        if self.failure_streak == self.station.alert_threshold {
            error!(
                "ALERT: serial link failed {} times in a row, last error: {e}",
                self.failure_streak
            );
        } else {
            warn!("Serial link error, retrying on next poll: {e}");
        }
    }

    async fn shutdown(&mut self) -> ExitReason {
        self.state = LoopState::ShuttingDown;
        info!("Shutting down dispatch loop");
        if let Err(e) = self.transport.close().await {
            warn!("Error while closing transport: {e}");
        }
        let stats = self.stats;
        info!(
            "Appended {} samples ({} dropped, {} malformed), {} forecast runs, {} records sent, {} predictor failures, {} transport errors",
            stats.appended,
            stats.dropped,
            stats.malformed,
            stats.forecast_runs,
            stats.records_sent,
            stats.predictor_failures,
            stats.transport_errors
        );
        ExitReason::Interrupted
    }
}

/// One-line description of a station's history for the run log.
fn series_summary(rows: &[DatasetRow]) -> String {
    match rows.last() {
        Some(last) => format!(
            "{} samples, last {} at {}-{}-{} {}h",
            rows.len(),
            last.temperature,
            last.year,
            last.month,
            last.day,
            last.hour
        ),
        None => "no samples".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetRow, StationDataset};
    use crate::error::PredictorError;
    use crate::serial::encoding::{RECORD_LEN, decode_records};
    use crate::serial::testing::MemoryTransport;
    use chrono::{DateTime, Local, TimeZone};

    /// Always Friday 2024-03-01.
    struct FixedClock;

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Local> {
            Local.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        }
    }

    /// Records what it was asked to forecast and what the dataset held.
    #[derive(Default)]
    struct RecordingPredictor {
        calls: Vec<(u32, Vec<String>)>,
        failing: Vec<u32>,
    }

    impl Predictor for RecordingPredictor {
        async fn produce_forecast(
            &mut self,
            dataset: &StationDataset,
        ) -> Result<Vec<f64>, PredictorError> {
            let rows = std::fs::read_to_string(&dataset.path)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect();
            self.calls.push((dataset.index, rows));
            if self.failing.contains(&dataset.index) {
                return Err(PredictorError::output("model diverged"));
            }
            Ok(vec![20.0, 21.5])
        }
    }

    fn dispatch_loop(
        dir: &tempfile::TempDir,
        lines: &[&str],
        predictor: RecordingPredictor,
    ) -> DispatchLoop<MemoryTransport, RecordingPredictor> {
        let station = BaseStation::new(DatasetRouter::new(dir.path()), predictor)
            .with_clock(FixedClock)
            .with_poll_interval(Duration::from_millis(5))
            .with_alert_threshold(2);
        DispatchLoop::new(MemoryTransport::with_lines(lines), station)
    }

    async fn drain(dispatch: &mut DispatchLoop<MemoryTransport, RecordingPredictor>) {
        while !dispatch.transport().inbound.is_empty() {
            dispatch.tick().await;
        }
    }

    #[tokio::test]
    async fn test_receive_garbage_run_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(
            &dir,
            &["receive-8-2024-03-01-09-18.2", "garbage", "run"],
            RecordingPredictor::default(),
        );

        drain(&mut dispatch).await;

        let stats = dispatch.stats();
        assert_eq!(stats.appended, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.forecast_runs, 1);
        assert_eq!(stats.records_sent, 2);
        let calls = &dispatch.station().predictor().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            (1, vec!["2024,03,01,09,18.2".to_string()])
        );
        assert_eq!(
            dispatch.station().router().read_series(1).unwrap(),
            vec![DatasetRow {
                year: "2024".to_string(),
                month: "03".to_string(),
                day: "01".to_string(),
                hour: "09".to_string(),
                temperature: 18.2,
            }]
        );
        assert_eq!(dispatch.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_run_sends_station_then_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(
            &dir,
            &[
                "receive-9-2024-03-01-09-11.0",
                "receive-8-2024-03-01-09-10.0",
                "run",
            ],
            RecordingPredictor::default(),
        );

        drain(&mut dispatch).await;

        let records = decode_records(&dispatch.transport().written);
        let order: Vec<u32> = records.iter().map(|r| r.station_index).collect();
        assert_eq!(order, vec![1, 1, 2, 2]);
        let days: Vec<&str> = records.iter().map(|r| r.day.as_str()).collect();
        assert_eq!(days, vec!["Friday", "Saturday", "Friday", "Saturday"]);
        let values: Vec<f64> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![20.0, 21.5, 20.0, 21.5]);
    }

    #[tokio::test]
    async fn test_predictor_failure_sends_nothing_for_station() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = RecordingPredictor {
            failing: vec![1],
            ..RecordingPredictor::default()
        };
        let mut dispatch = dispatch_loop(
            &dir,
            &[
                "receive-8-2024-03-01-09-10.0",
                "receive-9-2024-03-01-09-11.0",
                "run",
                "receive-8-2024-03-01-10-10.5",
            ],
            predictor,
        );

        drain(&mut dispatch).await;

        let stats = dispatch.stats();
        assert_eq!(stats.predictor_failures, 1);
        assert_eq!(stats.appended, 3);
        assert_eq!(dispatch.transport().written.len(), 2 * RECORD_LEN);
        let records = decode_records(&dispatch.transport().written);
        assert!(records.iter().all(|r| r.station_index == 2));
    }

    #[tokio::test]
    async fn test_invalid_station_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let datasets = dir.path().join("training_sets");
        let station = BaseStation::new(DatasetRouter::new(&datasets), RecordingPredictor::default());
        let mut dispatch = DispatchLoop::new(
            MemoryTransport::with_lines(&["receive-5-2024-03-01-09-18.2", "run"]),
            station,
        );

        while !dispatch.transport().inbound.is_empty() {
            dispatch.tick().await;
        }

        assert_eq!(dispatch.stats().dropped, 1);
        assert_eq!(dispatch.stats().appended, 0);
        assert!(!datasets.exists());
        assert!(dispatch.station().predictor().calls.is_empty());
        assert!(dispatch.transport().written.is_empty());
    }

    #[tokio::test]
    async fn test_transport_errors_are_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(&dir, &[], RecordingPredictor::default());
        let transport = &mut dispatch.transport;
        for _ in 0..3 {
            transport
                .inbound
                .push_back(Err(TransportError::read("device reports readiness but returned no data")));
        }
        transport
            .inbound
            .push_back(Ok("receive-8-2024-03-01-09-18.2\n".to_string()));

        assert_eq!(dispatch.tick().await, Tick::TransportFault);
        assert_eq!(dispatch.tick().await, Tick::TransportFault);
        assert_eq!(dispatch.tick().await, Tick::TransportFault);
        assert_eq!(dispatch.failure_streak(), 3);
        assert_eq!(dispatch.tick().await, Tick::Dispatched);
        assert_eq!(dispatch.failure_streak(), 0);
        assert_eq!(dispatch.stats().transport_errors, 3);
        assert_eq!(dispatch.stats().appended, 1);
        assert_eq!(dispatch.tick().await, Tick::Idle);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(
            &dir,
            &["receive-8-2024-03-01-09-18.2", "run", "receive-8-2024-03-01-10-18.4"],
            RecordingPredictor::default(),
        );
        dispatch.transport.fail_writes = true;

        drain(&mut dispatch).await;

        assert_eq!(dispatch.stats().transport_errors, 1);
        assert_eq!(dispatch.stats().records_sent, 0);
        assert_eq!(dispatch.stats().appended, 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(
            &dir,
            &["receive-8-2024-03-01-09-18.2"],
            RecordingPredictor::default(),
        );
        let (tx, rx) = watch::channel(false);

        let stop = async {
            time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
        };
        let (reason, ()) = tokio::join!(dispatch.run(rx), stop);

        assert_eq!(reason, ExitReason::Interrupted);
        assert_eq!(reason.exit_code(), 130);
        assert_eq!(dispatch.state(), LoopState::ShuttingDown);
        assert!(dispatch.transport().closed);
        assert_eq!(dispatch.stats().appended, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(&dir, &["run"], RecordingPredictor::default());
        let (_tx, rx) = watch::channel(true);

        let reason = dispatch.run(rx).await;

        assert_eq!(reason, ExitReason::Interrupted);
        assert!(dispatch.transport().closed);
        assert_eq!(dispatch.stats().forecast_runs, 0);
    }

    #[tokio::test]
    async fn test_exact_values_reach_the_wire() {
        struct PreciseModel;

        impl Predictor for PreciseModel {
            async fn produce_forecast(
                &mut self,
                _dataset: &StationDataset,
            ) -> Result<Vec<f64>, PredictorError> {
                Ok(vec![18.537, -3.141_592_653_589_793])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let station = BaseStation::new(DatasetRouter::new(dir.path()), PreciseModel)
            .with_clock(FixedClock);
        let mut dispatch = DispatchLoop::new(
            MemoryTransport::with_lines(&["receive-8-2024-03-01-09-18.2", "run"]),
            station,
        );
        while !dispatch.transport().inbound.is_empty() {
            dispatch.tick().await;
        }

        let pairs: Vec<(String, f64)> = decode_records(&dispatch.transport().written)
            .into_iter()
            .map(|r| (r.day, r.value))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Friday".to_string(), 18.537),
                ("Saturday".to_string(), -3.141_592_653_589_793),
            ]
        );
    }

    #[tokio::test]
    async fn test_overlong_line_counts_as_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(&dir, &[], RecordingPredictor::default());
        dispatch
            .transport
            .inbound
            .push_back(Err(TransportError::LineTooLong { limit: 256 }));
        dispatch
            .transport
            .inbound
            .push_back(Ok("receive-8-2024-03-01-09-18.2\n".to_string()));

        assert_eq!(dispatch.tick().await, Tick::Dispatched);
        assert_eq!(dispatch.tick().await, Tick::Dispatched);

        let stats = dispatch.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.transport_errors, 0);
        assert_eq!(stats.appended, 1);
        assert_eq!(dispatch.failure_streak(), 0);
    }

    #[tokio::test]
    async fn test_empty_lines_are_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(&dir, &["", "  ", "\r"], RecordingPredictor::default());

        drain(&mut dispatch).await;

        assert_eq!(dispatch.stats(), DispatchStats::default());
    }

    #[tokio::test]
    async fn test_run_without_datasets_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatch = dispatch_loop(&dir, &["run"], RecordingPredictor::default());

        drain(&mut dispatch).await;

        assert_eq!(dispatch.stats().forecast_runs, 1);
        assert!(dispatch.station().predictor().calls.is_empty());
        assert!(dispatch.transport().written.is_empty());
    }

    #[test]
    fn test_series_summary() {
        let row = |hour: &str, temperature: f64| DatasetRow {
            year: "2024".to_string(),
            month: "03".to_string(),
            day: "01".to_string(),
            hour: hour.to_string(),
            temperature,
        };
        assert_eq!(series_summary(&[]), "no samples");
        assert_eq!(
            series_summary(&[row("09", 18.2), row("10", -1.5)]),
            "2 samples, last -1.5 at 2024-03-01 10h"
        );
    }
}
