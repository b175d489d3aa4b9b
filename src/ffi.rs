//! C ABI for the host driver.
//!
//! Every entry point takes the opaque handle returned by
//! [`client_engine_create`] and reports failures as negative status codes.
//! Lifecycle calls also leave a line in the log ring for [`client_engine_pop_log`].

use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;
use std::slice;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::client::{ClientIdentity, ClientRecord, ClientVolumeUpdate};
use crate::config::EngineConfig;
use crate::dsp::RealtimeProcessor;
use crate::engine::ClientEngine;
use crate::error::EngineError;
use crate::logging::{init_tracing, pop_log, push_log};
use crate::notify::{NotificationSink, PropertiesChanged};
use crate::ring::ROUTING_CHANNELS;

/// Success.
pub const CLIENT_ENGINE_OK: i32 = 0;
/// A required pointer was null.
pub const CLIENT_ENGINE_ERR_NULL: i32 = -1;
/// Unknown client id.
pub const CLIENT_ENGINE_ERR_INVALID_CLIENT: i32 = -2;
/// Negative process id.
pub const CLIENT_ENGINE_ERR_INVALID_PID: i32 = -3;
/// Parameter out of range.
pub const CLIENT_ENGINE_ERR_OUT_OF_RANGE: i32 = -4;
/// Required field missing.
pub const CLIENT_ENGINE_ERR_MISSING_FIELD: i32 = -5;
/// IO counter overflow.
pub const CLIENT_ENGINE_ERR_OVERFLOW: i32 = -6;
/// IO counter underflow.
pub const CLIENT_ENGINE_ERR_UNDERFLOW: i32 = -7;
/// Every client table slot is taken.
pub const CLIENT_ENGINE_ERR_TABLE_FULL: i32 = -8;
/// Configuration rejected.
pub const CLIENT_ENGINE_ERR_CONFIG: i32 = -9;
/// The gain pipeline was busy; routing still ran but gains were not applied.
pub const CLIENT_ENGINE_ERR_BUSY: i32 = -10;

static LOG_CACHE: Lazy<Mutex<Option<CString>>> = Lazy::new(|| Mutex::new(None));

fn status_code(err: &EngineError) -> i32 {
    match err {
        EngineError::InvalidClient(_) => CLIENT_ENGINE_ERR_INVALID_CLIENT,
        EngineError::InvalidPid(_) => CLIENT_ENGINE_ERR_INVALID_PID,
        EngineError::OutOfRange { .. } => CLIENT_ENGINE_ERR_OUT_OF_RANGE,
        EngineError::MissingField(_) => CLIENT_ENGINE_ERR_MISSING_FIELD,
        EngineError::CounterOverflow => CLIENT_ENGINE_ERR_OVERFLOW,
        EngineError::CounterUnderflow => CLIENT_ENGINE_ERR_UNDERFLOW,
        EngineError::TableFull { .. } => CLIENT_ENGINE_ERR_TABLE_FULL,
        EngineError::InvalidConfig(_) => CLIENT_ENGINE_ERR_CONFIG,
    }
}

fn report<T>(call: &str, result: Result<T, EngineError>) -> Result<T, i32> {
    result.map_err(|err| {
        warn!(call, %err, "engine call failed");
        push_log(format!("{call} failed: {err}"));
        status_code(&err)
    })
}

/// Callback receiving changed property ids (see [`DeviceProperty`](crate::DeviceProperty)).
pub type ClientEnginePropertiesCallback =
    Option<unsafe extern "C" fn(ctx: *mut c_void, properties: *const u32, count: u32)>;

struct CallbackSink {
    callback: ClientEnginePropertiesCallback,
    ctx: *mut c_void,
}

// The host promises `ctx` may be used from the notifier thread.
unsafe impl Send for CallbackSink {}

impl NotificationSink for CallbackSink {
    fn properties_changed(&mut self, change: PropertiesChanged) {
        let Some(callback) = self.callback else {
            return;
        };
        let mut ids = [0u32; 2];
        let mut count = 0;
        for (slot, property) in ids.iter_mut().zip(change.properties()) {
            *slot = property as u32;
            count += 1;
        }
        unsafe { callback(self.ctx, ids.as_ptr(), count) };
    }
}

/// Engine plus the state its IO cycle owns.
pub struct ClientEngineHandle {
    engine: ClientEngine,
    rt: Mutex<RealtimeProcessor>,
}

impl ClientEngineHandle {
    /// The engine behind this handle.
    pub fn engine(&self) -> &ClientEngine {
        &self.engine
    }
}

/// Create an engine. Zero arguments fall back to the environment/defaults.
///
/// Returns null if the configuration is rejected.
#[unsafe(no_mangle)]
pub extern "C" fn client_engine_create(
    sample_rate: u32,
    routing_buffer_frames: u32,
    client_capacity: u32,
    callback: ClientEnginePropertiesCallback,
    ctx: *mut c_void,
) -> *mut ClientEngineHandle {
    init_tracing();
    let mut config = EngineConfig::from_env();
    if sample_rate != 0 {
        config.sample_rate = sample_rate;
    }
    if routing_buffer_frames != 0 {
        config.routing_buffer_frames = routing_buffer_frames as usize;
    }
    if client_capacity != 0 {
        config.client_capacity = client_capacity as usize;
    }
    let engine = match ClientEngine::new(config, CallbackSink { callback, ctx }) {
        Ok(engine) => engine,
        Err(err) => {
            warn!(%err, "client engine creation failed");
            push_log(format!("create failed: {err}"));
            return ptr::null_mut();
        }
    };
    let rt = Mutex::new(RealtimeProcessor::new(&engine));
    push_log("client engine created");
    Box::into_raw(Box::new(ClientEngineHandle { engine, rt }))
}

/// Destroy an engine created by [`client_engine_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_destroy(handle: *mut ClientEngineHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
        push_log("client engine destroyed");
    }
}

/// Register a connecting client. `bundle_id` may be null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_add_client(
    handle: *const ClientEngineHandle,
    client_id: u32,
    process_id: i32,
    bundle_id: *const c_char,
    is_native_endian: bool,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return CLIENT_ENGINE_ERR_NULL;
    };
    let mut identity = ClientIdentity::new(client_id, process_id);
    identity.is_native_endian = is_native_endian;
    if !bundle_id.is_null() {
        let bundle = unsafe { CStr::from_ptr(bundle_id) };
        identity.bundle_id = Some(bundle.to_string_lossy().into_owned());
    }
    match report("add_client", handle.engine.add_client(ClientRecord::new(identity))) {
        Ok(()) => {
            push_log(format!("client {client_id} added pid={process_id}"));
            CLIENT_ENGINE_OK
        }
        Err(code) => code,
    }
}

/// Unregister a disconnecting client.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_remove_client(
    handle: *const ClientEngineHandle,
    client_id: u32,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return CLIENT_ENGINE_ERR_NULL;
    };
    match report("remove_client", handle.engine.remove_client(client_id)) {
        Ok(()) => {
            push_log(format!("client {client_id} removed"));
            CLIENT_ENGINE_OK
        }
        Err(code) => code,
    }
}

/// Start IO for a client. `device_changed` (nullable) receives whether the device started.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_start_io(
    handle: *const ClientEngineHandle,
    client_id: u32,
    device_changed: *mut bool,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return CLIENT_ENGINE_ERR_NULL;
    };
    match report("start_io", handle.engine.start_io(client_id)) {
        Ok(changed) => {
            if let Some(out) = unsafe { device_changed.as_mut() } {
                *out = changed;
            }
            if changed {
                info!(client_id, "device started");
                push_log(format!("device started by client {client_id}"));
            }
            CLIENT_ENGINE_OK
        }
        Err(code) => code,
    }
}

/// Stop IO for a client. `device_changed` (nullable) receives whether the device stopped.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_stop_io(
    handle: *const ClientEngineHandle,
    client_id: u32,
    device_changed: *mut bool,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return CLIENT_ENGINE_ERR_NULL;
    };
    match report("stop_io", handle.engine.stop_io(client_id)) {
        Ok(changed) => {
            if let Some(out) = unsafe { device_changed.as_mut() } {
                *out = changed;
            }
            if changed {
                info!(client_id, "device stopped");
                push_log(format!("device stopped by client {client_id}"));
            }
            CLIENT_ENGINE_OK
        }
        Err(code) => code,
    }
}

/// One IO-cycle step for a client's interleaved stereo `buffer`.
///
/// The client's raw audio is stored for routing, its gain pipeline is applied
/// in place, then audio routed to it is mixed in. Safe to call from the
/// audio thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_write_mix(
    handle: *const ClientEngineHandle,
    client_id: u32,
    buffer: *mut f32,
    frame_count: u32,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return CLIENT_ENGINE_ERR_NULL;
    };
    if buffer.is_null() {
        return CLIENT_ENGINE_ERR_NULL;
    }
    let frames = frame_count as usize;
    let samples = unsafe { slice::from_raw_parts_mut(buffer, frames * ROUTING_CHANNELS) };

    let engine = &handle.engine;
    if engine.get_client_rt(client_id).is_none() {
        return CLIENT_ENGINE_ERR_INVALID_CLIENT;
    }
    engine.store_client_audio(client_id, samples, frames);
    let status = match handle.rt.try_lock() {
        Some(mut rt) => {
            rt.process_client(engine, client_id, samples, frames);
            CLIENT_ENGINE_OK
        }
        None => CLIENT_ENGINE_ERR_BUSY,
    };
    engine.mix_routed_audio(client_id, samples, frames);
    status
}

/// Create, update or disable the route `source_pid -> dest_pid`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_set_route(
    handle: *const ClientEngineHandle,
    source_pid: i32,
    dest_pid: i32,
    gain: f32,
    enabled: bool,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return CLIENT_ENGINE_ERR_NULL;
    };
    match report(
        "set_route",
        handle.engine.set_route(source_pid, dest_pid, gain, enabled),
    ) {
        Ok(_) => {
            push_log(format!(
                "route {source_pid}->{dest_pid} gain={gain} enabled={enabled}"
            ));
            CLIENT_ENGINE_OK
        }
        Err(code) => code,
    }
}

/// Remove every route touching `process_id`. Returns how many were removed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_clear_routes(
    handle: *const ClientEngineHandle,
    process_id: i32,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return CLIENT_ENGINE_ERR_NULL;
    };
    let removed = handle.engine.clear_routes_for_client(process_id);
    i32::try_from(removed).unwrap_or(i32::MAX)
}

/// Set the raw relative volume (0..=100, 50 is unity) for every client of `process_id`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_set_volume(
    handle: *const ClientEngineHandle,
    process_id: i32,
    raw_volume: f32,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return CLIENT_ENGINE_ERR_NULL;
    };
    let update = ClientVolumeUpdate {
        relative_volume: Some(raw_volume),
        ..ClientVolumeUpdate::for_pid(process_id)
    };
    let batch = handle.engine.set_clients_relative_volumes(&[update]);
    match batch.rejected.first() {
        Some(err) => status_code(err),
        None => CLIENT_ENGINE_OK,
    }
}

/// Clients currently running IO.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn client_engine_clients_running_io(
    handle: *const ClientEngineHandle,
) -> u32 {
    unsafe { handle.as_ref() }.map_or(0, |handle| handle.engine.clients_running_io())
}

/// Pop the next buffered log line. Returns `NULL` when none remain.
///
/// The pointer stays valid until the next call.
#[unsafe(no_mangle)]
pub extern "C" fn client_engine_pop_log() -> *const c_char {
    if let Some(message) = pop_log() {
        let mut cache = LOG_CACHE.lock();
        *cache = Some(CString::new(message).unwrap_or_default());
        cache.as_ref().map(|c| c.as_ptr()).unwrap_or(ptr::null())
    } else {
        ptr::null()
    }
}
