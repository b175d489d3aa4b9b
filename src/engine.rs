//! The per-client routing and mixing engine.
//!
//! Administrative calls (client lifecycle, IO bookkeeping, volumes, routes)
//! serialise through one `parking_lot::Mutex`. Real-time calls never touch it:
//! they read client records through the lock-free [`ClientTable`], routes
//! through an `ArcSwap` snapshot, and routed audio through each source's
//! [`RoutingBuffer`](crate::ring::RoutingBuffer).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::client::{
    ClientRecord, ClientVolumeUpdate, EQ_MAX_TENTHS_DB, EQ_MIN_TENTHS_DB, PAN_CENTER_RAW,
    PAN_LEFT_RAW, PAN_RIGHT_RAW, RELATIVE_VOLUME_MAX_RAW, RELATIVE_VOLUME_MIN_RAW, TRIM_MAX_DB,
    TRIM_MIN_DB, eq_tenths_to_db, relative_volume_from_raw,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::io::{IoCounters, IoTransition};
use crate::notify::{NotificationSink, Notifier, PropertiesChanged};
use crate::reclaim::Graveyard;
use crate::ring::ROUTING_CHANNELS;
use crate::routing::{Route, RouteUpdate, RoutingGraph, validate_route};
use crate::table::ClientTable;

/// Outcome of a bulk administrative call.
///
/// Rejected entries or fields are listed; everything else was applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    /// Whether any client or route actually changed.
    pub changed: bool,
    /// Validation failures for the entries or fields that were skipped.
    pub rejected: Vec<EngineError>,
}

/// Read-only view of the engine for tooling.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    /// Connected clients, ordered by id.
    pub clients: Vec<ClientStatus>,
    /// Every route, enabled or not.
    pub routes: Vec<Route>,
    /// Clients running IO.
    pub clients_running_io: u32,
    /// Clients other than the app client running IO.
    pub clients_other_than_app_running_io: u32,
    /// Id of the connected app client, if any.
    pub app_client_id: Option<u32>,
    /// Music player process id, if set.
    pub music_player_pid: Option<i32>,
    /// Music player bundle id, if set.
    pub music_player_bundle_id: Option<String>,
}

/// One client's entry in [`EngineStatus`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClientStatus {
    /// Mixing state.
    pub record: ClientRecord,
    /// Whether the client currently owns a routing buffer.
    pub has_routing_buffer: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
enum MusicPlayer {
    #[default]
    Unset,
    Pid(i32),
    BundleId(String),
}

impl MusicPlayer {
    fn matches(&self, record: &ClientRecord) -> bool {
        match self {
            MusicPlayer::Unset => false,
            MusicPlayer::Pid(pid) => record.process_id() == *pid,
            MusicPlayer::BundleId(id) => record.bundle_id() == Some(id.as_str()),
        }
    }
}

struct AdminState {
    graph: RoutingGraph,
    music_player: MusicPlayer,
    app_client_id: Option<u32>,
    graveyard: Graveyard,
}

/// Owns the client table, routing graph and IO counters of one virtual device.
pub struct ClientEngine {
    config: EngineConfig,
    admin: Mutex<AdminState>,
    table: ClientTable,
    routes: ArcSwap<Vec<Route>>,
    counters: IoCounters,
    solo_active: AtomicBool,
    notifier: Notifier,
}

impl ClientEngine {
    /// Build an engine that reports IO state changes to `sink`.
    pub fn new(config: EngineConfig, sink: impl NotificationSink) -> EngineResult<Self> {
        config.validate()?;
        let notifier = Notifier::spawn(sink)
            .map_err(|err| EngineError::InvalidConfig(format!("notifier thread: {err}")))?;
        let table = ClientTable::new(config.client_capacity, config.routing_buffer_frames);
        info!(
            capacity = config.client_capacity,
            routing_frames = config.routing_buffer_frames,
            "client engine created"
        );
        Ok(Self {
            config,
            admin: Mutex::new(AdminState {
                graph: RoutingGraph::new(),
                music_player: MusicPlayer::Unset,
                app_client_id: None,
                graveyard: Graveyard::default(),
            }),
            table,
            routes: ArcSwap::from_pointee(Vec::new()),
            counters: IoCounters::new(),
            solo_active: AtomicBool::new(false),
            notifier,
        })
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Slots in the real-time client table.
    pub fn table_capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Table slot and current record of a connected client.
    pub(crate) fn client_slot_rt(&self, client_id: u32) -> Option<(usize, Arc<ClientRecord>)> {
        self.table.client_slot_rt(client_id)
    }

    // ---- client lifecycle ----------------------------------------------------

    /// Register a newly connected client.
    pub fn add_client(&self, mut record: ClientRecord) -> EngineResult<()> {
        let mut admin = self.admin.lock();
        let client_id = record.client_id();
        let process_id = record.process_id();
        record.is_music_player = admin.music_player.matches(&record);
        // IO state is owned by start_io/stop_io; a re-add keeps the live value.
        record.doing_io = self
            .table
            .client(client_id)
            .is_ok_and(|existing| existing.doing_io);
        let is_app = record.bundle_id() == Some(self.config.app_bundle_id.as_str());
        let soloed = record.soloed;

        self.table.add_client(record)?;

        if is_app {
            match admin.app_client_id {
                // A running app client keeps its id so its IO is uncounted on stop.
                Some(previous)
                    if previous != client_id
                        && self.table.client(previous).is_ok_and(|r| r.doing_io) =>
                {
                    warn!(previous, client_id, "app client already running, keeping it");
                }
                _ => admin.app_client_id = Some(client_id),
            }
        }
        if soloed {
            self.refresh_solo();
        }
        if admin.graph.is_enabled_source(process_id) {
            self.sync_routing_buffers(&mut admin);
        }
        info!(client_id, process_id, is_app, "client added");
        Ok(())
    }

    /// Unregister a client, purging every route that references its process.
    pub fn remove_client(&self, client_id: u32) -> EngineResult<()> {
        let mut admin = self.admin.lock();
        let record = self.table.remove_client(client_id)?;
        let is_app = admin.app_client_id == Some(client_id);
        if is_app {
            admin.app_client_id = None;
        }
        if record.doing_io {
            warn!(client_id, "client removed while running IO");
            match self.counters.stop(is_app) {
                Ok(transition) => self.notify(transition),
                Err(err) => error!(client_id, %err, "IO counters out of step on removal"),
            }
        }
        if record.soloed {
            self.refresh_solo();
        }
        self.clear_routes_locked(&mut admin, record.process_id());
        info!(client_id, process_id = record.process_id(), "client removed");
        Ok(())
    }

    /// Copy of a client's record.
    pub fn client(&self, client_id: u32) -> EngineResult<ClientRecord> {
        self.table.client(client_id)
    }

    /// Copies of every client's record.
    pub fn clients(&self) -> Vec<ClientRecord> {
        self.table.clients()
    }

    /// Mark the clients of `process_id` as the music player.
    ///
    /// Clears any bundle id previously set. Returns whether the setting changed.
    pub fn set_music_player_pid(&self, process_id: i32) -> EngineResult<bool> {
        if process_id < 0 {
            return Err(EngineError::InvalidPid(process_id));
        }
        Ok(self.set_music_player(MusicPlayer::Pid(process_id)))
    }

    /// Mark the clients with `bundle_id` as the music player.
    ///
    /// Clears any pid previously set. Returns whether the setting changed.
    pub fn set_music_player_bundle_id(&self, bundle_id: &str) -> bool {
        self.set_music_player(MusicPlayer::BundleId(bundle_id.to_string()))
    }

    fn set_music_player(&self, next: MusicPlayer) -> bool {
        let mut admin = self.admin.lock();
        if admin.music_player == next {
            return false;
        }
        admin.music_player = next;
        let player = &admin.music_player;
        let flagged = self
            .table
            .update_all(|record| record.is_music_player = player.matches(record));
        debug!(?player, flagged, "music player changed");
        true
    }

    /// Music player process id, if set by pid.
    pub fn music_player_pid(&self) -> Option<i32> {
        match self.admin.lock().music_player {
            MusicPlayer::Pid(pid) => Some(pid),
            _ => None,
        }
    }

    /// Music player bundle id, if set by bundle id.
    pub fn music_player_bundle_id(&self) -> Option<String> {
        match &self.admin.lock().music_player {
            MusicPlayer::BundleId(id) => Some(id.clone()),
            _ => None,
        }
    }

    // ---- IO arbitration ------------------------------------------------------

    /// Mark a client as running IO.
    ///
    /// Returns true when this start took the device from idle to running.
    /// Starting a client that is already running is a no-op returning false.
    pub fn start_io(&self, client_id: u32) -> EngineResult<bool> {
        let admin = self.admin.lock();
        let record = self.table.client(client_id)?;
        if record.doing_io {
            return Ok(false);
        }
        let is_app = admin.app_client_id == Some(client_id);
        let transition = self
            .counters
            .start(is_app)
            .inspect_err(|err| error!(client_id, %err, "refusing to start IO"))?;
        self.table.update_client(client_id, |r| r.doing_io = true)?;
        debug!(
            client_id,
            total = self.counters.total(),
            excluding_app = self.counters.excluding_app(),
            "IO started"
        );
        self.notify(transition);
        Ok(transition.device_changed)
    }

    /// Mark a client as no longer running IO.
    ///
    /// Returns true when this stop took the device from running to idle.
    /// Stopping a client that is not running is a no-op returning false.
    pub fn stop_io(&self, client_id: u32) -> EngineResult<bool> {
        let admin = self.admin.lock();
        let record = self.table.client(client_id)?;
        if !record.doing_io {
            return Ok(false);
        }
        let is_app = admin.app_client_id == Some(client_id);
        let transition = self
            .counters
            .stop(is_app)
            .inspect_err(|err| error!(client_id, %err, "refusing to stop IO"))?;
        self.table.update_client(client_id, |r| r.doing_io = false)?;
        debug!(
            client_id,
            total = self.counters.total(),
            excluding_app = self.counters.excluding_app(),
            "IO stopped"
        );
        self.notify(transition);
        Ok(transition.device_changed)
    }

    fn notify(&self, transition: IoTransition) {
        if let Some(change) = PropertiesChanged::from_edges(
            transition.device_changed,
            transition.running_elsewhere_changed,
        ) {
            self.notifier.post(change);
        }
    }

    /// Clients running IO.
    pub fn clients_running_io(&self) -> u32 {
        self.counters.total()
    }

    /// Clients other than the app client running IO.
    pub fn clients_other_than_app_running_io(&self) -> u32 {
        self.counters.excluding_app()
    }

    // ---- volumes -------------------------------------------------------------

    /// Apply a batch of per-process/bundle volume, pan, EQ, trim, mute and solo updates.
    ///
    /// Entries without a valid target are skipped; out-of-range fields are
    /// skipped individually while the entry's valid fields still apply.
    pub fn set_clients_relative_volumes(&self, updates: &[ClientVolumeUpdate]) -> BatchReport {
        let _admin = self.admin.lock();
        let mut report = BatchReport::default();
        let mut solo_touched = false;

        for update in updates {
            let process_id = match update.process_id {
                Some(pid) if pid < 0 => {
                    report.rejected.push(EngineError::InvalidPid(pid));
                    None
                }
                other => other,
            };
            let bundle_id = update.bundle_id.as_deref();
            if process_id.is_none() && bundle_id.is_none() {
                if update.process_id.is_none() {
                    report
                        .rejected
                        .push(EngineError::MissingField("process_id or bundle_id"));
                }
                continue;
            }

            let fields = ValidatedFields::from_update(update, &mut report.rejected);
            if fields.is_empty() {
                continue;
            }
            solo_touched |= fields.soloed.is_some();
            let changed = self
                .table
                .update_matching(process_id, bundle_id, |record| fields.apply(record));
            if changed > 0 {
                debug!(?process_id, ?bundle_id, changed, "client mix updated");
                report.changed = true;
            }
        }

        if solo_touched {
            self.refresh_solo();
        }
        for rejection in &report.rejected {
            warn!(%rejection, "volume update rejected");
        }
        report
    }

    fn refresh_solo(&self) {
        let any = self.table.clients().iter().any(|record| record.soloed);
        self.solo_active.store(any, Ordering::Release);
    }

    // ---- routing -------------------------------------------------------------

    /// Create or update the route `source_pid -> dest_pid`.
    ///
    /// Returns whether anything changed. Disabling a pair with no route is a no-op.
    pub fn set_route(
        &self,
        source_pid: i32,
        dest_pid: i32,
        gain: f32,
        enabled: bool,
    ) -> EngineResult<bool> {
        validate_route(source_pid, dest_pid, gain)?;
        let mut admin = self.admin.lock();
        let changed = admin.graph.set_route(source_pid, dest_pid, gain, enabled);
        if changed {
            self.sync_routing_buffers(&mut admin);
        }
        Ok(changed)
    }

    /// Apply many route updates under one lock acquisition.
    ///
    /// Each entry upserts its pair exactly like [`set_route`](Self::set_route);
    /// malformed entries are skipped and listed in the report.
    pub fn replace_routes(&self, updates: &[RouteUpdate]) -> BatchReport {
        let mut admin = self.admin.lock();
        let mut report = BatchReport::default();
        for update in updates {
            match update.resolve() {
                Ok(route) => {
                    report.changed |= admin.graph.set_route(
                        route.source_pid,
                        route.dest_pid,
                        route.gain,
                        route.enabled,
                    );
                }
                Err(err) => {
                    warn!(?update, %err, "skipping malformed route");
                    report.rejected.push(err);
                }
            }
        }
        if report.changed {
            self.sync_routing_buffers(&mut admin);
        }
        report
    }

    /// Remove every route with `process_id` at either end and free its buffers.
    /// Returns the number of routes removed.
    pub fn clear_routes_for_client(&self, process_id: i32) -> usize {
        let mut admin = self.admin.lock();
        self.clear_routes_locked(&mut admin, process_id)
    }

    fn clear_routes_locked(&self, admin: &mut AdminState, process_id: i32) -> usize {
        let removed = admin.graph.clear_routes_for(process_id);
        self.sync_routing_buffers(admin);
        if removed > 0 {
            debug!(process_id, removed, "routes cleared");
        }
        removed
    }

    /// Snapshot of every route, enabled or not.
    pub fn export_routes(&self) -> Vec<Route> {
        self.admin.lock().graph.routes().to_vec()
    }

    /// Bring routing buffers and the real-time route snapshot in line with the graph.
    ///
    /// Buffers are allocated before the snapshot that needs them is published,
    /// and released only after the snapshot that stops using them.
    fn sync_routing_buffers(&self, admin: &mut AdminState) {
        let clients = self.table.clients();
        for record in &clients {
            if admin.graph.is_enabled_source(record.process_id()) {
                if let Err(err) = self.table.ensure_routing_buffer(record.client_id()) {
                    warn!(client_id = record.client_id(), %err, "routing buffer not allocated");
                }
            }
        }

        let enabled: Vec<Route> = admin
            .graph
            .routes()
            .iter()
            .filter(|route| route.enabled)
            .copied()
            .collect();
        if **self.routes.load() != enabled {
            let previous = self.routes.swap(Arc::new(enabled));
            admin.graveyard.retire(previous);
        }

        for record in &clients {
            if !admin.graph.is_enabled_source(record.process_id()) {
                if let Err(err) = self.table.release_routing_buffer(record.client_id()) {
                    warn!(client_id = record.client_id(), %err, "routing buffer not released");
                }
            }
        }
    }

    /// Read-only snapshot for tooling.
    pub fn status(&self) -> EngineStatus {
        let admin = self.admin.lock();
        let clients = self
            .table
            .clients()
            .into_iter()
            .map(|record| ClientStatus {
                has_routing_buffer: self.table.has_routing_buffer(record.client_id()),
                record,
            })
            .collect();
        let (music_player_pid, music_player_bundle_id) = match &admin.music_player {
            MusicPlayer::Unset => (None, None),
            MusicPlayer::Pid(pid) => (Some(*pid), None),
            MusicPlayer::BundleId(id) => (None, Some(id.clone())),
        };
        EngineStatus {
            clients,
            routes: admin.graph.routes().to_vec(),
            clients_running_io: self.counters.total(),
            clients_other_than_app_running_io: self.counters.excluding_app(),
            app_client_id: admin.app_client_id,
            music_player_pid,
            music_player_bundle_id,
        }
    }

    // ---- real-time path ------------------------------------------------------

    /// Current record of a connected client.
    pub fn get_client_rt(&self, client_id: u32) -> Option<Arc<ClientRecord>> {
        self.table.get_client_rt(client_id)
    }

    /// Current record of the first client owned by `process_id`.
    pub fn get_client_by_pid_rt(&self, process_id: i32) -> Option<Arc<ClientRecord>> {
        self.table.get_client_by_pid_rt(process_id)
    }

    /// Relative volume of a client, unity if unknown.
    pub fn relative_volume_rt(&self, client_id: u32) -> f32 {
        self.get_client_rt(client_id)
            .map_or(1.0, |record| record.relative_volume)
    }

    /// Raw pan of a client, centered if unknown.
    pub fn pan_position_rt(&self, client_id: u32) -> i32 {
        self.get_client_rt(client_id)
            .map_or(PAN_CENTER_RAW, |record| record.pan_position)
    }

    /// Whether any client is soloed.
    pub fn solo_active_rt(&self) -> bool {
        self.solo_active.load(Ordering::Acquire)
    }

    /// Whether the device has any client running IO.
    pub fn is_running_rt(&self) -> bool {
        self.counters.total() > 0
    }

    /// Whether a client other than the app client is running IO.
    pub fn is_running_somewhere_other_than_app_rt(&self) -> bool {
        self.counters.excluding_app() > 0
    }

    /// Whether the app client is running IO.
    pub fn is_app_client_running_rt(&self) -> bool {
        // Only the app client makes the two counters differ.
        self.counters.total() != self.counters.excluding_app()
    }

    /// Forward a client's captured audio into its routing buffer.
    ///
    /// Does nothing unless the client's process is the source of an enabled
    /// route, which is exactly when it owns a buffer.
    pub fn store_client_audio(&self, client_id: u32, buffer: &[f32], frame_count: usize) {
        let Some((slot, _)) = self.table.client_slot_rt(client_id) else {
            return;
        };
        self.table
            .with_routing_buffer_rt(slot, |ring| ring.store_frames(buffer, frame_count));
    }

    /// Whether any enabled route delivers audio to this client.
    pub fn has_incoming_routes(&self, client_id: u32) -> bool {
        let Some(dest) = self.table.get_client_rt(client_id) else {
            return false;
        };
        let routes = self.routes.load();
        routes.iter().any(|route| route.dest_pid == dest.process_id())
    }

    /// Add every enabled inbound route's audio into `io_buffer`.
    ///
    /// For output frame `f` the source sample `frame_count - f` frames back is
    /// read, so the most recently completed block arrives in order with one
    /// buffer of latency. Vanished sources are skipped.
    pub fn mix_routed_audio(&self, dest_client_id: u32, io_buffer: &mut [f32], frame_count: usize) {
        let Some(dest) = self.table.get_client_rt(dest_client_id) else {
            return;
        };
        let frames = frame_count.min(io_buffer.len() / ROUTING_CHANNELS);
        let samples = &mut io_buffer[..frames * ROUTING_CHANNELS];
        let routes = self.routes.load();

        for route in routes.iter().filter(|r| r.dest_pid == dest.process_id()) {
            let Some((source_slot, _)) = self.table.client_by_pid_rt(route.source_pid) else {
                continue;
            };
            let gain = route.gain;
            self.table.with_routing_buffer_rt(source_slot, |ring| {
                for (f, frame) in samples.chunks_exact_mut(ROUTING_CHANNELS).enumerate() {
                    let offset = (frames - f) as u64;
                    for (channel, sample) in frame.iter_mut().enumerate() {
                        *sample += ring.fetch(channel, offset) * gain;
                    }
                }
            });
        }
    }
}

/// Fields of a [`ClientVolumeUpdate`] that passed validation, converted to engine units.
#[derive(Default)]
struct ValidatedFields {
    relative_volume: Option<f32>,
    pan_position: Option<i32>,
    eq_low: Option<f32>,
    eq_mid: Option<f32>,
    eq_high: Option<f32>,
    trim_db: Option<f32>,
    muted: Option<bool>,
    soloed: Option<bool>,
}

impl ValidatedFields {
    fn from_update(update: &ClientVolumeUpdate, rejected: &mut Vec<EngineError>) -> Self {
        let mut fields = Self {
            muted: update.muted,
            soloed: update.soloed,
            ..Self::default()
        };

        if let Some(raw) = update.relative_volume {
            if (RELATIVE_VOLUME_MIN_RAW..=RELATIVE_VOLUME_MAX_RAW).contains(&raw) {
                fields.relative_volume = Some(relative_volume_from_raw(raw));
            } else {
                rejected.push(out_of_range("relative volume", raw as f64));
            }
        }
        if let Some(pan) = update.pan_position {
            if (PAN_LEFT_RAW..=PAN_RIGHT_RAW).contains(&pan) {
                fields.pan_position = Some(pan);
            } else {
                rejected.push(out_of_range("pan position", pan as f64));
            }
        }
        let eq_band = |name: &'static str, value: Option<i32>, rejected: &mut Vec<EngineError>| {
            let tenths = value?;
            if (EQ_MIN_TENTHS_DB..=EQ_MAX_TENTHS_DB).contains(&tenths) {
                Some(eq_tenths_to_db(tenths))
            } else {
                rejected.push(out_of_range(name, tenths as f64));
                None
            }
        };
        fields.eq_low = eq_band("eq low", update.eq_low, rejected);
        fields.eq_mid = eq_band("eq mid", update.eq_mid, rejected);
        fields.eq_high = eq_band("eq high", update.eq_high, rejected);
        if let Some(trim) = update.trim_db {
            if (TRIM_MIN_DB..=TRIM_MAX_DB).contains(&trim) {
                fields.trim_db = Some(trim);
            } else {
                rejected.push(out_of_range("trim", trim as f64));
            }
        }
        fields
    }

    fn is_empty(&self) -> bool {
        self.relative_volume.is_none()
            && self.pan_position.is_none()
            && self.eq_low.is_none()
            && self.eq_mid.is_none()
            && self.eq_high.is_none()
            && self.trim_db.is_none()
            && self.muted.is_none()
            && self.soloed.is_none()
    }

    fn apply(&self, record: &mut ClientRecord) {
        if let Some(volume) = self.relative_volume {
            record.relative_volume = volume;
        }
        if let Some(pan) = self.pan_position {
            record.pan_position = pan;
        }
        if let Some(db) = self.eq_low {
            record.eq.low_db = Some(db);
        }
        if let Some(db) = self.eq_mid {
            record.eq.mid_db = Some(db);
        }
        if let Some(db) = self.eq_high {
            record.eq.high_db = Some(db);
        }
        if let Some(trim) = self.trim_db {
            record.trim_db = trim;
        }
        if let Some(muted) = self.muted {
            record.muted = muted;
        }
        if let Some(soloed) = self.soloed {
            record.soloed = soloed;
        }
    }
}

fn out_of_range(field: &'static str, value: f64) -> EngineError {
    EngineError::OutOfRange { field, value }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientIdentity;
    use crate::notify::{DeviceProperty, NullSink};
    use std::time::Duration;

    fn engine() -> ClientEngine {
        let config = EngineConfig::default()
            .with_client_capacity(16)
            .with_routing_buffer_frames(64);
        ClientEngine::new(config, NullSink).unwrap()
    }

    fn client(client_id: u32, pid: i32) -> ClientRecord {
        ClientRecord::new(ClientIdentity::new(client_id, pid))
    }

    fn app_client(engine: &ClientEngine, client_id: u32, pid: i32) -> ClientRecord {
        ClientRecord::new(
            ClientIdentity::new(client_id, pid).with_bundle_id(engine.config().app_bundle_id.clone()),
        )
    }

    #[test]
    fn start_and_stop_report_device_edges() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        engine.add_client(client(2, 20)).unwrap();

        assert!(engine.start_io(1).unwrap());
        assert!(!engine.start_io(1).unwrap());
        assert!(!engine.start_io(2).unwrap());
        assert_eq!(engine.clients_running_io(), 2);

        assert!(!engine.stop_io(1).unwrap());
        assert!(!engine.stop_io(1).unwrap());
        assert!(engine.stop_io(2).unwrap());
        assert_eq!(engine.clients_running_io(), 0);
        assert!(!engine.is_running_rt());
    }

    #[test]
    fn unknown_clients_are_rejected() {
        let engine = engine();
        assert_eq!(engine.start_io(9), Err(EngineError::InvalidClient(9)));
        assert_eq!(engine.stop_io(9), Err(EngineError::InvalidClient(9)));
        assert_eq!(engine.remove_client(9), Err(EngineError::InvalidClient(9)));
    }

    #[test]
    fn app_client_is_excluded_from_elsewhere_count() {
        let engine = engine();
        engine.add_client(app_client(&engine, 1, 10)).unwrap();
        engine.add_client(client(2, 20)).unwrap();
        assert_eq!(engine.status().app_client_id, Some(1));

        engine.start_io(1).unwrap();
        assert_eq!(engine.clients_running_io(), 1);
        assert_eq!(engine.clients_other_than_app_running_io(), 0);
        assert!(engine.is_app_client_running_rt());
        engine.start_io(2).unwrap();
        assert_eq!(engine.clients_other_than_app_running_io(), 1);
        assert!(engine.is_running_somewhere_other_than_app_rt());

        engine.remove_client(1).unwrap();
        assert_eq!(engine.status().app_client_id, None);
        assert!(!engine.is_app_client_running_rt());
        assert_eq!(engine.clients_running_io(), 1);
        assert_eq!(engine.clients_other_than_app_running_io(), 1);
    }

    #[test]
    fn notifications_follow_counter_edges() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = ClientEngine::new(EngineConfig::default(), move |change| {
            let _ = tx.send(change);
        })
        .unwrap();
        engine.add_client(app_client(&engine, 1, 10)).unwrap();
        engine.add_client(client(2, 20)).unwrap();

        engine.start_io(1).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(first.contains(DeviceProperty::DeviceIsRunning));
        assert!(!first.contains(DeviceProperty::DeviceIsRunningSomewhereOtherThanApp));

        engine.start_io(2).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            second.properties().collect::<Vec<_>>(),
            vec![DeviceProperty::DeviceIsRunningSomewhereOtherThanApp]
        );
    }

    #[test]
    fn removing_a_running_client_releases_its_io() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        engine.start_io(1).unwrap();
        engine.remove_client(1).unwrap();
        assert_eq!(engine.clients_running_io(), 0);
        assert_eq!(engine.clients_other_than_app_running_io(), 0);
    }

    #[test]
    fn re_adding_a_running_client_keeps_its_io_state() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        engine.start_io(1).unwrap();
        engine.add_client(client(1, 10)).unwrap();
        assert!(engine.client(1).unwrap().doing_io);
        assert!(engine.stop_io(1).unwrap());
    }

    #[test]
    fn music_player_is_set_by_pid_or_bundle_exclusively() {
        let engine = engine();
        engine
            .add_client(ClientRecord::new(
                ClientIdentity::new(1, 10).with_bundle_id("com.player"),
            ))
            .unwrap();
        engine.add_client(client(2, 20)).unwrap();

        assert!(engine.set_music_player_pid(20).unwrap());
        assert!(!engine.set_music_player_pid(20).unwrap());
        assert!(engine.client(2).unwrap().is_music_player);
        assert!(!engine.client(1).unwrap().is_music_player);

        assert!(engine.set_music_player_bundle_id("com.player"));
        assert_eq!(engine.music_player_pid(), None);
        assert_eq!(engine.music_player_bundle_id().as_deref(), Some("com.player"));
        assert!(engine.client(1).unwrap().is_music_player);
        assert!(!engine.client(2).unwrap().is_music_player);

        assert_eq!(engine.set_music_player_pid(-4), Err(EngineError::InvalidPid(-4)));

        // A client connecting later is flagged on insertion.
        engine
            .add_client(ClientRecord::new(
                ClientIdentity::new(3, 30).with_bundle_id("com.player"),
            ))
            .unwrap();
        assert!(engine.client(3).unwrap().is_music_player);
    }

    #[test]
    fn volume_batch_applies_valid_fields_and_reports_the_rest() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        engine.add_client(client(2, 10)).unwrap();

        let report = engine.set_clients_relative_volumes(&[
            ClientVolumeUpdate {
                relative_volume: Some(25.0),
                pan_position: Some(400),
                eq_low: Some(30),
                ..ClientVolumeUpdate::for_pid(10)
            },
            ClientVolumeUpdate {
                relative_volume: Some(50.0),
                ..ClientVolumeUpdate::default()
            },
            ClientVolumeUpdate {
                relative_volume: Some(50.0),
                ..ClientVolumeUpdate::for_pid(-3)
            },
        ]);

        assert!(report.changed);
        assert_eq!(
            report.rejected,
            vec![
                EngineError::OutOfRange {
                    field: "pan position",
                    value: 400.0
                },
                EngineError::MissingField("process_id or bundle_id"),
                EngineError::InvalidPid(-3),
            ]
        );
        for id in [1, 2] {
            let record = engine.client(id).unwrap();
            assert!((record.relative_volume - 0.25).abs() < 1e-6);
            assert_eq!(record.pan_position, 0);
            assert_eq!(record.eq.low_db, Some(3.0));
        }
        assert!((engine.relative_volume_rt(1) - 0.25).abs() < 1e-6);
        assert_eq!(engine.relative_volume_rt(99), 1.0);
        assert_eq!(engine.pan_position_rt(99), 0);
    }

    #[test]
    fn volume_batch_reaches_every_client_of_a_bundle() {
        let engine = engine();
        engine
            .add_client(ClientRecord::new(
                ClientIdentity::new(1, 10).with_bundle_id("com.example.Player"),
            ))
            .unwrap();
        engine
            .add_client(ClientRecord::new(
                ClientIdentity::new(2, 11).with_bundle_id("com.example.Player"),
            ))
            .unwrap();
        engine.add_client(client(3, 12)).unwrap();

        let report = engine.set_clients_relative_volumes(&[ClientVolumeUpdate {
            relative_volume: Some(100.0),
            pan_position: Some(-100),
            eq_high: Some(-60),
            ..ClientVolumeUpdate::for_bundle_id("com.example.Player")
        }]);

        assert!(report.changed);
        assert!(report.rejected.is_empty());
        for id in [1, 2] {
            let record = engine.client(id).unwrap();
            assert!((record.relative_volume - 4.0).abs() < 1e-6);
            assert_eq!(record.pan_position, -100);
            assert_eq!(record.eq.high_db, Some(-6.0));
            assert_eq!(engine.pan_position_rt(id), -100);
        }
        let untouched = engine.client(3).unwrap();
        assert_eq!(untouched.relative_volume, 1.0);
        assert_eq!(untouched.pan_position, 0);

        let again = engine.set_clients_relative_volumes(&[ClientVolumeUpdate {
            relative_volume: Some(100.0),
            ..ClientVolumeUpdate::for_bundle_id("com.example.Player")
        }]);
        assert!(!again.changed);
        let nobody = engine.set_clients_relative_volumes(&[ClientVolumeUpdate {
            relative_volume: Some(10.0),
            ..ClientVolumeUpdate::for_bundle_id("com.example.Absent")
        }]);
        assert!(!nobody.changed);
        assert!(nobody.rejected.is_empty());
    }

    #[test]
    fn solo_flag_tracks_any_soloed_client() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        assert!(!engine.solo_active_rt());
        engine.set_clients_relative_volumes(&[ClientVolumeUpdate {
            soloed: Some(true),
            ..ClientVolumeUpdate::for_pid(10)
        }]);
        assert!(engine.solo_active_rt());
        engine.remove_client(1).unwrap();
        assert!(!engine.solo_active_rt());
    }

    #[test]
    fn routing_buffers_follow_enabled_sources() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        engine.add_client(client(2, 20)).unwrap();

        assert!(engine.set_route(10, 20, 1.0, true).unwrap());
        let status = engine.status();
        assert!(status.clients[0].has_routing_buffer);
        assert!(!status.clients[1].has_routing_buffer);
        assert!(engine.has_incoming_routes(2));
        assert!(!engine.has_incoming_routes(1));

        assert!(engine.set_route(10, 20, 1.0, false).unwrap());
        assert!(!engine.status().clients[0].has_routing_buffer);
        assert!(!engine.has_incoming_routes(2));
        assert_eq!(engine.export_routes().len(), 1);
    }

    #[test]
    fn late_source_gets_a_buffer_on_connect() {
        let engine = engine();
        engine.set_route(10, 20, 1.0, true).unwrap();
        engine.add_client(client(1, 10)).unwrap();
        assert!(engine.status().clients[0].has_routing_buffer);
    }

    #[test]
    fn invalid_routes_are_refused() {
        let engine = engine();
        assert_eq!(
            engine.set_route(-1, 2, 1.0, true),
            Err(EngineError::InvalidPid(-1))
        );
        assert!(matches!(
            engine.set_route(1, 2, f32::NAN, true),
            Err(EngineError::OutOfRange { field: "route gain", .. })
        ));
        assert!(engine.export_routes().is_empty());
    }

    #[test]
    fn replace_routes_upserts_and_skips_malformed_entries() {
        let engine = engine();
        engine.set_route(1, 2, 0.5, true).unwrap();
        let report = engine.replace_routes(&[
            RouteUpdate::new(1, 2, 0.8, true),
            RouteUpdate::new(3, 4, 1.0, true),
            RouteUpdate {
                source_pid: Some(5),
                ..RouteUpdate::default()
            },
        ]);
        assert!(report.changed);
        assert_eq!(report.rejected, vec![EngineError::MissingField("dest_pid")]);
        let routes = engine.export_routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].gain, 0.8);
    }

    #[test]
    fn removing_a_client_purges_its_routes() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        engine.add_client(client(2, 20)).unwrap();
        engine.set_route(10, 20, 1.0, true).unwrap();
        engine.set_route(30, 40, 1.0, true).unwrap();

        engine.remove_client(1).unwrap();
        assert_eq!(engine.export_routes(), vec![Route {
            source_pid: 30,
            dest_pid: 40,
            gain: 1.0,
            enabled: true
        }]);
        assert_eq!(engine.clear_routes_for_client(40), 1);
        assert_eq!(engine.clear_routes_for_client(40), 0);
    }

    #[test]
    fn routed_audio_arrives_one_block_late_with_gain() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        engine.add_client(client(2, 20)).unwrap();
        engine.set_route(10, 20, 0.5, true).unwrap();

        let block: Vec<f32> = (0..8).flat_map(|i| [i as f32, -(i as f32)]).collect();
        engine.store_client_audio(1, &block, 8);

        let mut out = vec![1.0f32; 16];
        engine.mix_routed_audio(2, &mut out, 8);
        for f in 0..8 {
            assert_eq!(out[2 * f], 1.0 + 0.5 * f as f32);
            assert_eq!(out[2 * f + 1], 1.0 - 0.5 * f as f32);
        }
    }

    #[test]
    fn clients_without_routes_are_not_stored_or_mixed() {
        let engine = engine();
        engine.add_client(client(1, 10)).unwrap();
        engine.add_client(client(2, 20)).unwrap();
        engine.store_client_audio(1, &[1.0; 8], 4);
        let mut out = vec![0.0f32; 8];
        engine.mix_routed_audio(2, &mut out, 4);
        assert!(out.iter().all(|s| *s == 0.0));
        engine.mix_routed_audio(77, &mut out, 4);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
