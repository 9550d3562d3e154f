//!
//! `extern "C"` entry points handed to the engine for user functions.
//!
//! Every entry point recovers its `FunctionRecord` from the engine's
//! user-data pointer and holds its own strong reference for the duration of
//! the call. User code runs under `catch_unwind`; errors and panics are
//! reported through the context's result-error channel.
//!

use std::any::Any;
use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use litebridge_core::{Error, Result};
use rusqlite::ffi;

use crate::context::Context;
use crate::function::{FunctionRecord, RecordKind};

unsafe fn record_of(ctx: *mut ffi::sqlite3_context) -> Rc<FunctionRecord> {
    let ptr = unsafe { ffi::sqlite3_user_data(ctx) } as *const FunctionRecord;
    unsafe {
        Rc::increment_strong_count(ptr);
        Rc::from_raw(ptr)
    }
}

unsafe fn args_of<'call>(
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) -> &'call [*mut ffi::sqlite3_value] {
    if argc <= 0 || argv.is_null() {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(argv, argc as usize) }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn guarded<F>(name: &str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(Error::function(format!(
            "user function '{name}' panicked: {}",
            panic_message(&*payload)
        ))),
    }
}

fn report_failure(ctx: &mut Context<'_>, name: &str, err: Error) {
    tracing::debug!(function = name, error = %err, "user function failed");
    match err {
        Error::OutOfMemory => ctx.result_error_nomem(),
        err => {
            let _ = ctx.result_error(&err.to_string());
        }
    }
}

pub(crate) unsafe extern "C" fn call_scalar(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let record = unsafe { record_of(ctx) };
    let mut context = Context::for_call(ctx, unsafe { args_of(argc, argv) });
    let RecordKind::Scalar(function) = &record.kind else {
        return;
    };
    if record.retired.get() {
        let _ = context.result_null();
        return;
    }

    let outcome = guarded(&record.name, || {
        let mut function = function.try_borrow_mut().map_err(|_| {
            Error::function(format!("user function '{}' called re-entrantly", record.name))
        })?;
        function.call(&mut context)
    });
    if let Err(err) = outcome {
        report_failure(&mut context, &record.name, err);
    }
}

/// Scope slot in the engine's per-group storage. `None` when the engine
/// could not allocate it.
unsafe fn scope_slot(ctx: *mut ffi::sqlite3_context, allocate: bool) -> Option<*mut u64> {
    let size = if allocate { std::mem::size_of::<u64>() as c_int } else { 0 };
    let slot = unsafe { ffi::sqlite3_aggregate_context(ctx, size) } as *mut u64;
    (!slot.is_null()).then_some(slot)
}

pub(crate) unsafe extern "C" fn call_aggregate_step(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let record = unsafe { record_of(ctx) };
    let mut context = Context::for_call(ctx, unsafe { args_of(argc, argv) });
    let RecordKind::Aggregate(state) = &record.kind else {
        return;
    };
    if record.retired.get() {
        return;
    }

    let Some(slot) = (unsafe { scope_slot(ctx, true) }) else {
        context.result_error_nomem();
        return;
    };
    // Engine storage starts zeroed; 0 means no scope has been opened.
    let mut scope = unsafe { slot.read_unaligned() };
    if scope == 0 {
        scope = state.open_scope();
        unsafe { slot.write_unaligned(scope) };
    }

    let mut instance = state.take_instance(scope);
    let outcome = guarded(&record.name, || instance.step(&mut context));
    state.restore(scope, instance);
    if let Err(err) = outcome {
        report_failure(&mut context, &record.name, err);
    }
}

pub(crate) unsafe extern "C" fn call_aggregate_final(ctx: *mut ffi::sqlite3_context) {
    let record = unsafe { record_of(ctx) };
    let mut context = Context::for_final(ctx);
    let RecordKind::Aggregate(state) = &record.kind else {
        return;
    };

    let scope = unsafe { scope_slot(ctx, false) }
        .map(|slot| unsafe { slot.read_unaligned() })
        .unwrap_or(0);
    let mut instance = if scope == 0 {
        state.fresh()
    } else {
        state.take_instance(scope)
    };
    if record.retired.get() {
        let _ = context.result_null();
        return;
    }

    let outcome = guarded(&record.name, || instance.finish(&mut context));
    if let Err(err) = outcome {
        report_failure(&mut context, &record.name, err);
    }
}

/// Destroy callback: drops the engine's share of a record.
pub(crate) unsafe extern "C" fn release_record(data: *mut c_void) {
    if data.is_null() {
        return;
    }
    let record = unsafe { Rc::from_raw(data as *const FunctionRecord) };
    if panic::catch_unwind(AssertUnwindSafe(move || drop(record))).is_err() {
        tracing::warn!("panic while releasing a user function");
    }
}
