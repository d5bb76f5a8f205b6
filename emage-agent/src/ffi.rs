//! C ABI for linking the agent as a static library into a C radio stack.
//!
//! C callers have nowhere to keep a [`Registry`], so this layer owns one for the life of the
//! process, together with the runtime that drives it. Controller settings come from the
//! config file (see [`crate::config`]).
//!
//! Entry points block the calling thread. They may be called from any thread the runtime does
//! not drive, including from inside the `EmAgentOps` callbacks. The exceptions are `em_stop`
//! and `em_terminate_agent`: they wait for the session whose callback is running, so inside a
//! callback they refuse with `-EDEADLK`.

use std::cell::Cell;
use std::os::raw::{c_char, c_int, c_uint};
use std::slice;
use std::sync::{Arc, OnceLock};

use emage_core::{AgentOps, EnbId, OpsError, OpsResult, TriggerKind};
use tracing::error;

use crate::config;
use crate::registry::Registry;

const EINVAL: c_int = -22;
const EIO: c_int = -5;
const EDEADLK: c_int = -35;

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Run a technology callback with the reentrancy flag set for this thread.
fn callback<T>(f: impl FnOnce() -> T) -> T {
    let outer = IN_CALLBACK.with(|c| c.replace(true));
    let out = f();
    IN_CALLBACK.with(|c| c.set(outer));
    out
}

fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// Technology callbacks, mirroring `struct em_agent_ops`. Every callback returns 0 on success
/// or a negative error code. Missing `init`/`release`/`disconnected` are treated as success;
/// missing setup handlers make the agent refuse those requests.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EmAgentOps {
    pub init: Option<extern "C" fn() -> c_int>,
    pub release: Option<extern "C" fn() -> c_int>,
    pub disconnected: Option<extern "C" fn() -> c_int>,
    pub enb_setup_request: Option<extern "C" fn() -> c_int>,
    pub cell_setup_request: Option<extern "C" fn(cell_id: c_int) -> c_int>,
}

struct CallbackOps(EmAgentOps);

fn status(rc: c_int) -> Result<(), OpsError> {
    if rc < 0 {
        Err(OpsError::Code(rc))
    } else {
        Ok(())
    }
}

impl AgentOps for CallbackOps {
    fn init(&self) -> Result<(), OpsError> {
        self.0.init.map_or(Ok(()), |f| status(callback(|| f())))
    }

    fn release(&self) -> Result<(), OpsError> {
        self.0.release.map_or(Ok(()), |f| status(callback(|| f())))
    }

    fn disconnected(&self) {
        if let Some(f) = self.0.disconnected {
            callback(|| f());
        }
    }

    // C handlers answer through em_send, so a successful call never carries a reply body.
    fn enb_setup_request(&self) -> OpsResult {
        let f = self.0.enb_setup_request.ok_or(OpsError::Unsupported)?;
        status(callback(|| f())).map(|()| None)
    }

    fn cell_setup_request(&self, cell_id: u16) -> OpsResult {
        let f = self.0.cell_setup_request.ok_or(OpsError::Unsupported)?;
        status(callback(|| f(c_int::from(cell_id)))).map(|()| None)
    }
}

struct Host {
    runtime: tokio::runtime::Runtime,
    registry: Registry,
}

fn host() -> Option<&'static Host> {
    static HOST: OnceLock<Option<Host>> = OnceLock::new();
    HOST.get_or_init(|| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("emage-agent")
            .enable_all()
            .build()
            .map_err(|e| error!(error = %e, "cannot start agent runtime"))
            .ok()?;
        let registry = Registry::new(config::load().controller_config());
        Some(Host { runtime, registry })
    })
    .as_ref()
}

fn enb(enb_id: c_int) -> Option<EnbId> {
    EnbId::try_from(enb_id).ok()
}

/// Start an agent for `enb_id`. Returns 0 on success, a negative error code otherwise.
///
/// # Safety
/// `ops` must be null or point to a valid `EmAgentOps`; it is copied before returning.
#[no_mangle]
pub unsafe extern "C" fn em_start(ops: *const EmAgentOps, enb_id: c_int) -> c_int {
    let (Some(enb_id), false) = (enb(enb_id), ops.is_null()) else {
        return EINVAL;
    };
    let Some(h) = host() else {
        return EIO;
    };
    let ops: Arc<dyn AgentOps> = Arc::new(CallbackOps(unsafe { *ops }));
    match h.runtime.block_on(h.registry.start(ops, enb_id)) {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

/// Terminate every agent. Returns 0, or `-EDEADLK` when called from a callback.
#[no_mangle]
pub extern "C" fn em_stop() -> c_int {
    if in_callback() {
        return EDEADLK;
    }
    if let Some(h) = host() {
        h.runtime.block_on(h.registry.stop());
    }
    0
}

/// Terminate a single agent. Returns 0, or `-EDEADLK` when called from a callback.
#[no_mangle]
pub extern "C" fn em_terminate_agent(enb_id: c_int) -> c_int {
    if in_callback() {
        return EDEADLK;
    }
    if let (Some(h), Some(enb_id)) = (host(), enb(enb_id)) {
        let _ = h.runtime.block_on(h.registry.terminate(enb_id));
    }
    0
}

/// Send `size` bytes of an encoded message to the agent's controller. The agent adds the
/// length header. Returns 0 on success, a negative error code otherwise.
///
/// # Safety
/// `msg` must be valid for reads of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn em_send(enb_id: c_int, msg: *const c_char, size: c_uint) -> c_int {
    let Some(enb_id) = enb(enb_id) else {
        return EINVAL;
    };
    if msg.is_null() && size > 0 {
        return EINVAL;
    }
    let Some(h) = host() else {
        return EIO;
    };
    let payload: &[u8] = if size == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(msg as *const u8, size as usize) }
    };
    match h.runtime.block_on(h.registry.send(enb_id, payload)) {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// Returns 1 if the agent is connected to a controller, 0 otherwise.
#[no_mangle]
pub extern "C" fn em_is_connected(enb_id: c_int) -> c_int {
    match (host(), enb(enb_id)) {
        (Some(h), Some(enb_id)) => c_int::from(h.registry.is_connected(enb_id)),
        _ => 0,
    }
}

/// Returns 1 if trigger `tid` of type `ttype` is armed on the agent, 0 otherwise.
#[no_mangle]
pub extern "C" fn em_has_trigger(enb_id: c_int, tid: c_int, ttype: c_int) -> c_int {
    let Ok(kind) = TriggerKind::try_from(ttype) else {
        return 0;
    };
    match (host(), enb(enb_id)) {
        (Some(h), Some(enb_id)) => c_int::from(h.registry.has_trigger(enb_id, tid, kind)),
        _ => 0,
    }
}

/// Remove trigger `tid` from the agent. Returns 0 on success, a negative error code otherwise.
#[no_mangle]
pub extern "C" fn em_del_trigger(enb_id: c_int, tid: c_int) -> c_int {
    let Some(enb_id) = enb(enb_id) else {
        return EINVAL;
    };
    let Some(h) = host() else {
        return EIO;
    };
    match h.registry.disarm_trigger(enb_id, tid) {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}
