use std::ffi::{c_char, c_void, CStr, CString};
use std::slice;
use std::sync::{Arc, Mutex};

use crate::events::{lock, EventBridge, NativeEventEnvelope};
use crate::guard::isolate;
use crate::native::{EntityId, NativeEngine, NativeError};

/// Returned by the string getters when the key or component does not exist.
pub const STATUS_ABSENT: i32 = -1;
pub const STATUS_OK: i32 = 0;

const WILDCARD: &[u8] = b"*\0";
const INITIAL_STRING_BUFFER: usize = 256;
const INITIAL_ENTITY_BUFFER: usize = 1024;
const MAX_READ_ATTEMPTS: usize = 4;

pub type NativeContext = *mut c_void;

/// Receives every native event. `name` is NUL-terminated; `payload` is `payload_len` bytes.
pub type EnvelopeCallback =
    unsafe extern "C" fn(name: *const c_char, payload: *const u8, payload_len: usize, user_data: *mut c_void);

/// Function table handed over by the native engine.
///
/// String getters write at most `out_size` bytes including a trailing NUL and return the full
/// value length, so a return value `>= out_size` means the buffer was too small.
/// `get_all_entities` writes up to `max_count` ids and returns the total live count. Any other
/// negative value is a failure code.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeApi {
    pub context: NativeContext,
    pub subscribe_event: unsafe extern "C" fn(
        context: NativeContext,
        pattern: *const c_char,
        callback: EnvelopeCallback,
        user_data: *mut c_void,
    ) -> i32,
    pub get_tick_interval: unsafe extern "C" fn(context: NativeContext) -> f32,
    pub get_all_entities: unsafe extern "C" fn(context: NativeContext, out: *mut u64, max_count: i32) -> i32,
    pub create_entity: unsafe extern "C" fn(context: NativeContext, out: *mut u64) -> i32,
    pub destroy_entity: unsafe extern "C" fn(context: NativeContext, entity: u64) -> i32,
    pub is_alive: unsafe extern "C" fn(context: NativeContext, entity: u64) -> i32,
    pub get_component_json: unsafe extern "C" fn(
        context: NativeContext,
        entity: u64,
        component: *const c_char,
        out: *mut c_char,
        out_size: i32,
    ) -> i32,
    pub set_component_json:
        unsafe extern "C" fn(context: NativeContext, entity: u64, component: *const c_char, json: *const c_char) -> i32,
    pub get_script_data: unsafe extern "C" fn(
        context: NativeContext,
        entity: u64,
        key: *const c_char,
        out: *mut c_char,
        out_size: i32,
    ) -> i32,
    pub set_script_data:
        unsafe extern "C" fn(context: NativeContext, entity: u64, key: *const c_char, value: *const c_char) -> i32,
    pub remove_script_data: unsafe extern "C" fn(context: NativeContext, entity: u64, key: *const c_char) -> i32,
}

/// [`NativeEngine`] over a C function table.
pub struct FfiEngine {
    api: NativeApi,
    bridge: Mutex<Option<Arc<EventBridge>>>,
}

// SAFETY: `FfiEngine::new` requires the table to be callable from any thread.
unsafe impl Send for FfiEngine {}
unsafe impl Sync for FfiEngine {}

impl FfiEngine {
    /// # Safety
    /// Every function in `api` must stay valid for the lifetime of the engine and accept
    /// `api.context` from any thread.
    pub unsafe fn new(api: NativeApi) -> Self {
        Self { api, bridge: Mutex::new(None) }
    }

    /// Registers the envelope trampoline for every event name. The bridge is kept alive by the
    /// engine from then on; a second call is a no-op returning `false`.
    pub fn attach_bridge(&self, bridge: Arc<EventBridge>) -> Result<bool, NativeError> {
        let mut slot = lock(&self.bridge);
        if slot.is_some() {
            return Ok(false);
        }
        let user_data = Arc::as_ptr(&bridge) as *mut c_void;
        let code = unsafe {
            (self.api.subscribe_event)(self.api.context, WILDCARD.as_ptr().cast(), envelope_trampoline, user_data)
        };
        if code != STATUS_OK {
            return Err(NativeError::EngineCallFailed { call: "subscribe_event", code });
        }
        *slot = Some(bridge);
        tracing::info!(target: "native", "envelope callback registered");
        Ok(true)
    }

    pub fn is_bridge_attached(&self) -> bool {
        lock(&self.bridge).is_some()
    }

    fn read_string(
        &self,
        call: &'static str,
        entity: EntityId,
        key: &str,
        read: impl Fn(*const c_char, *mut c_char, i32) -> i32,
    ) -> Result<Option<String>, NativeError> {
        let c_key = c_string(call, key)?;
        let mut capacity = INITIAL_STRING_BUFFER;
        for _ in 0..MAX_READ_ATTEMPTS {
            let mut buffer = vec![0u8; capacity];
            let code = read(c_key.as_ptr(), buffer.as_mut_ptr().cast(), clamp_i32(capacity));
            if code == STATUS_ABSENT {
                return Ok(None);
            }
            if code < 0 {
                return Err(NativeError::CallFailed { call, entity, key: key.to_string(), code });
            }
            let len = code as usize;
            if len >= capacity {
                capacity = len + 1;
                continue;
            }
            buffer.truncate(len);
            return String::from_utf8(buffer)
                .map(Some)
                .map_err(|_| NativeError::InvalidUtf8 { entity, key: key.to_string() });
        }
        Err(NativeError::InvalidArgument { call, reason: format!("'{key}' kept growing while being read") })
    }

    fn status(&self, call: &'static str, entity: EntityId, key: &str, code: i32) -> Result<(), NativeError> {
        if code == STATUS_OK {
            Ok(())
        } else {
            Err(NativeError::CallFailed { call, entity, key: key.to_string(), code })
        }
    }
}

impl NativeEngine for FfiEngine {
    fn tick_interval(&self) -> f32 {
        unsafe { (self.api.get_tick_interval)(self.api.context) }
    }

    fn live_entities(&self, max_count: usize) -> Result<Vec<EntityId>, NativeError> {
        let mut capacity = max_count.min(INITIAL_ENTITY_BUFFER);
        for _ in 0..MAX_READ_ATTEMPTS {
            let mut buffer = vec![0u64; capacity];
            let code =
                unsafe { (self.api.get_all_entities)(self.api.context, buffer.as_mut_ptr(), clamp_i32(capacity)) };
            if code < 0 {
                return Err(NativeError::EngineCallFailed { call: "get_all_entities", code });
            }
            let total = code as usize;
            if total > capacity && capacity < max_count {
                capacity = total.min(max_count);
                continue;
            }
            buffer.truncate(total.min(capacity));
            return Ok(buffer.into_iter().map(EntityId::from_bits).collect());
        }
        Err(NativeError::InvalidArgument { call: "get_all_entities", reason: "entity count kept growing".into() })
    }

    fn create_entity(&self) -> Result<EntityId, NativeError> {
        let mut raw = 0u64;
        let code = unsafe { (self.api.create_entity)(self.api.context, &mut raw) };
        if code != STATUS_OK {
            return Err(NativeError::EngineCallFailed { call: "create_entity", code });
        }
        Ok(EntityId::from_bits(raw))
    }

    fn destroy_entity(&self, entity: EntityId) -> Result<(), NativeError> {
        let code = unsafe { (self.api.destroy_entity)(self.api.context, entity.to_bits()) };
        self.status("destroy_entity", entity, "", code)
    }

    fn is_alive(&self, entity: EntityId) -> bool {
        unsafe { (self.api.is_alive)(self.api.context, entity.to_bits()) > 0 }
    }

    fn component_json(&self, entity: EntityId, component: &str) -> Result<Option<String>, NativeError> {
        self.read_string("get_component_json", entity, component, |key, out, size| unsafe {
            (self.api.get_component_json)(self.api.context, entity.to_bits(), key, out, size)
        })
    }

    fn set_component_json(&self, entity: EntityId, component: &str, json: &str) -> Result<(), NativeError> {
        let (c_component, c_json) = (c_string("set_component_json", component)?, c_string("set_component_json", json)?);
        let code = unsafe {
            (self.api.set_component_json)(self.api.context, entity.to_bits(), c_component.as_ptr(), c_json.as_ptr())
        };
        self.status("set_component_json", entity, component, code)
    }

    fn script_data(&self, entity: EntityId, key: &str) -> Result<Option<String>, NativeError> {
        self.read_string("get_script_data", entity, key, |c_key, out, size| unsafe {
            (self.api.get_script_data)(self.api.context, entity.to_bits(), c_key, out, size)
        })
    }

    fn set_script_data(&self, entity: EntityId, key: &str, value: &str) -> Result<(), NativeError> {
        let (c_key, c_value) = (c_string("set_script_data", key)?, c_string("set_script_data", value)?);
        let code =
            unsafe { (self.api.set_script_data)(self.api.context, entity.to_bits(), c_key.as_ptr(), c_value.as_ptr()) };
        self.status("set_script_data", entity, key, code)
    }

    fn remove_script_data(&self, entity: EntityId, key: &str) -> Result<(), NativeError> {
        let c_key = c_string("remove_script_data", key)?;
        let code = unsafe { (self.api.remove_script_data)(self.api.context, entity.to_bits(), c_key.as_ptr()) };
        self.status("remove_script_data", entity, key, code)
    }
}

fn c_string(call: &'static str, value: &str) -> Result<CString, NativeError> {
    CString::new(value).map_err(|_| NativeError::InvalidArgument { call, reason: "interior NUL byte".into() })
}

fn clamp_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// The single callback registered with the native side. `user_data` is the `EventBridge`
/// owned by the attaching [`FfiEngine`]. Nothing unwinds out of this function.
///
/// # Safety
/// `name` must be NUL-terminated, `payload` must point at `payload_len` readable bytes (or be
/// null with a zero length) and `user_data` must come from [`FfiEngine::attach_bridge`].
pub unsafe extern "C" fn envelope_trampoline(
    name: *const c_char,
    payload: *const u8,
    payload_len: usize,
    user_data: *mut c_void,
) {
    let outcome = isolate(|| {
        if name.is_null() || user_data.is_null() {
            anyhow::bail!("null event name or bridge pointer");
        }
        let name = CStr::from_ptr(name).to_str()?;
        let payload = match (payload.is_null(), payload_len) {
            (_, 0) => &[][..],
            (true, len) => anyhow::bail!("event '{name}' has a null payload of {len} bytes"),
            (false, len) => slice::from_raw_parts(payload, len),
        };
        let bridge = &*(user_data as *const EventBridge);
        bridge.dispatch(NativeEventEnvelope::new(name, payload));
        Ok(())
    });
    if let Err(fault) = outcome {
        tracing::error!(target: "native", "event envelope rejected: {fault}");
    }
}
