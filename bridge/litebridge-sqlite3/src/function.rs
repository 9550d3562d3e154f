///
/// User-Defined Functions
///
/// Registrations are kept per connection in an insertion-ordered map from
/// lowercased name to a shared `FunctionRecord`. The engine holds its own
/// share of each record through the user-data pointer passed to
/// `sqlite3_create_function_v2`; that share is released by the engine's
/// destroy callback, whether the function is replaced, deleted, or the
/// connection closes.
///
/// A retired record is one the connection no longer routes to. Trampolines
/// that still reach it produce NULL instead of running user code.
///

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::ptr;
use std::rc::Rc;

use indexmap::IndexMap;
use litebridge_core::Result;
use rusqlite::ffi;

use crate::connection::Database;
use crate::context::Context;
use crate::status::engine_error;
use crate::trampoline::{call_aggregate_final, call_aggregate_step, call_scalar, release_record};

/// A function evaluated once per row.
pub trait ScalarFunction: 'static {
    fn call(&mut self, ctx: &mut Context<'_>) -> Result<()>;
}

impl<F> ScalarFunction for F
where
    F: FnMut(&mut Context<'_>) -> Result<()> + 'static,
{
    fn call(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        self(ctx)
    }
}

/// A function folded over the rows of a group.
///
/// The registered value is a prototype: each group works on its own clone,
/// which receives one `step` per row and a single `finish`.
pub trait AggregateFunction: AggregateClone {
    fn step(&mut self, ctx: &mut Context<'_>) -> Result<()>;

    /// Writes the group's result. The context carries no arguments.
    fn finish(&mut self, ctx: &mut Context<'_>) -> Result<()>;
}

/// Object-safe cloning for aggregate prototypes. Implemented for every
/// `Clone` aggregate.
pub trait AggregateClone {
    fn clone_box(&self) -> Box<dyn AggregateFunction>;
}

impl<T> AggregateClone for T
where
    T: AggregateFunction + Clone + 'static,
{
    fn clone_box(&self) -> Box<dyn AggregateFunction> {
        Box::new(self.clone())
    }
}

pub enum Function {
    Scalar(Box<dyn ScalarFunction>),
    Aggregate(Box<dyn AggregateFunction>),
}

impl Function {
    pub fn scalar<F>(f: F) -> Self
    where
        F: FnMut(&mut Context<'_>) -> Result<()> + 'static,
    {
        Function::Scalar(Box::new(f))
    }

    pub fn aggregate<A>(prototype: A) -> Self
    where
        A: AggregateFunction + 'static,
    {
        Function::Aggregate(Box::new(prototype))
    }
}

pub(crate) struct FunctionRecord {
    pub(crate) name: String,
    pub(crate) retired: Cell<bool>,
    pub(crate) kind: RecordKind,
}

pub(crate) enum RecordKind {
    Scalar(RefCell<Box<dyn ScalarFunction>>),
    Aggregate(AggregateState),
}

impl FunctionRecord {
    fn new(name: &str, function: Function) -> Self {
        let kind = match function {
            Function::Scalar(f) => RecordKind::Scalar(RefCell::new(f)),
            Function::Aggregate(prototype) => RecordKind::Aggregate(AggregateState::new(prototype)),
        };
        Self {
            name: name.to_string(),
            retired: Cell::new(false),
            kind,
        }
    }

    fn retire(&self) {
        self.retired.set(true);
        if let RecordKind::Aggregate(state) = &self.kind {
            state.instances.borrow_mut().clear();
        }
    }
}

/// Live aggregate instances keyed by scope id. Id 0 is never assigned; it
/// marks engine storage that has no scope yet.
pub(crate) struct AggregateState {
    prototype: Box<dyn AggregateFunction>,
    instances: RefCell<HashMap<u64, Box<dyn AggregateFunction>>>,
    next_scope: Cell<u64>,
}

impl AggregateState {
    fn new(prototype: Box<dyn AggregateFunction>) -> Self {
        Self {
            prototype,
            instances: RefCell::new(HashMap::new()),
            next_scope: Cell::new(0),
        }
    }

    pub(crate) fn open_scope(&self) -> u64 {
        let id = self.next_scope.get() + 1;
        self.next_scope.set(id);
        id
    }

    pub(crate) fn fresh(&self) -> Box<dyn AggregateFunction> {
        self.prototype.clone_box()
    }

    /// Removes the scope's instance, cloning the prototype if the scope has
    /// none yet.
    pub(crate) fn take_instance(&self, scope: u64) -> Box<dyn AggregateFunction> {
        self.instances
            .borrow_mut()
            .remove(&scope)
            .unwrap_or_else(|| self.fresh())
    }

    pub(crate) fn restore(&self, scope: u64, instance: Box<dyn AggregateFunction>) {
        self.instances.borrow_mut().insert(scope, instance);
    }

    #[cfg(test)]
    pub(crate) fn live_instances(&self) -> usize {
        self.instances.borrow().len()
    }
}

#[derive(Default)]
pub(crate) struct FunctionRegistry {
    records: IndexMap<String, Rc<FunctionRecord>>,
}

fn registry_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl FunctionRegistry {
    pub(crate) fn register(
        &mut self,
        db: *mut ffi::sqlite3,
        name: &str,
        function: Function,
    ) -> Result<()> {
        let c_name = CString::new(name)?;
        let record = Rc::new(FunctionRecord::new(name, function));
        let is_aggregate = matches!(record.kind, RecordKind::Aggregate(_));

        // Released by `release_record`, including when registration fails.
        let engine_share = Rc::into_raw(Rc::clone(&record)) as *mut c_void;

        let rc = unsafe {
            if is_aggregate {
                ffi::sqlite3_create_function_v2(
                    db,
                    c_name.as_ptr(),
                    -1,
                    ffi::SQLITE_UTF8,
                    engine_share,
                    None,
                    Some(call_aggregate_step),
                    Some(call_aggregate_final),
                    Some(release_record),
                )
            } else {
                ffi::sqlite3_create_function_v2(
                    db,
                    c_name.as_ptr(),
                    -1,
                    ffi::SQLITE_UTF8,
                    engine_share,
                    Some(call_scalar),
                    None,
                    None,
                    Some(release_record),
                )
            }
        };
        if rc != ffi::SQLITE_OK {
            return Err(engine_error(db, rc));
        }

        tracing::debug!(name, aggregate = is_aggregate, "registered function");
        if let Some(previous) = self.records.insert(registry_key(name), record) {
            previous.retire();
        }
        Ok(())
    }

    pub(crate) fn unregister(&mut self, db: *mut ffi::sqlite3, name: &str) -> Result<()> {
        let key = registry_key(name);
        let Some(record) = self.records.get(&key) else {
            return Ok(());
        };
        remove_from_engine(db, &record.name)?;
        if let Some(record) = self.records.shift_remove(&key) {
            record.retire();
        }
        tracing::debug!(name, "unregistered function");
        Ok(())
    }

    /// Retires and unregisters every record. Failures are logged; the
    /// engine releases its shares when the connection closes regardless.
    pub(crate) fn teardown(&mut self, db: *mut ffi::sqlite3) {
        let count = self.records.len();
        for (_, record) in self.records.drain(..) {
            record.retire();
            if let Err(err) = remove_from_engine(db, &record.name) {
                tracing::warn!(name = %record.name, error = %err, "failed to unregister function");
            }
        }
        if count > 0 {
            tracing::debug!(count, "released function registrations");
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, name: &str) -> Option<&Rc<FunctionRecord>> {
        self.records.get(&registry_key(name))
    }

    #[cfg(test)]
    pub(crate) fn names(&self) -> Vec<&str> {
        self.records.values().map(|record| record.name.as_str()).collect()
    }
}

/// Registering a name with no callbacks deletes it from the engine.
fn remove_from_engine(db: *mut ffi::sqlite3, name: &str) -> Result<()> {
    let c_name = CString::new(name)?;
    let rc = unsafe {
        ffi::sqlite3_create_function_v2(
            db,
            c_name.as_ptr(),
            -1,
            ffi::SQLITE_UTF8,
            ptr::null_mut(),
            None,
            None,
            None,
            None,
        )
    };
    if rc != ffi::SQLITE_OK {
        return Err(engine_error(db, rc));
    }
    Ok(())
}

impl Database {
    /// Registers `function` under `name`, replacing any function of the same
    /// name once the engine accepts the new one.
    pub fn register_function(&mut self, name: &str, function: Function) -> Result<()> {
        let db = self.handle()?;
        self.functions.register(db, name, function)
    }

    /// Stops routing `name` to its function and releases it. Unknown names
    /// are ignored.
    pub fn unregister_function(&mut self, name: &str) -> Result<()> {
        let db = self.handle()?;
        self.functions.unregister(db, name)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::{Error, Value};

    fn memory_db() -> Database {
        let mut db = Database::new();
        db.open(":memory:").expect("open in-memory database");
        db
    }

    fn query_long(db: &Database, sql: &str) -> i64 {
        let mut stmt = db.prepare(sql).unwrap();
        assert!(stmt.step().unwrap());
        stmt.column_long(0)
    }

    #[derive(Clone)]
    struct Sum {
        total: i64,
        steps: Rc<Cell<usize>>,
        finals: Rc<Cell<usize>>,
    }

    impl AggregateFunction for Sum {
        fn step(&mut self, ctx: &mut Context<'_>) -> Result<()> {
            self.steps.set(self.steps.get() + 1);
            self.total += ctx.arg_long(0)?;
            Ok(())
        }

        fn finish(&mut self, ctx: &mut Context<'_>) -> Result<()> {
            self.finals.set(self.finals.get() + 1);
            ctx.result_long(self.total)
        }
    }

    fn sum_function() -> (Function, Rc<Cell<usize>>, Rc<Cell<usize>>) {
        let steps = Rc::new(Cell::new(0));
        let finals = Rc::new(Cell::new(0));
        let sum = Sum {
            total: 0,
            steps: Rc::clone(&steps),
            finals: Rc::clone(&finals),
        };
        (Function::aggregate(sum), steps, finals)
    }

    fn numbers_table(db: &Database, n: i64) {
        db.exec("CREATE TABLE nums(grp INTEGER, v INTEGER)").unwrap();
        let mut stmt = db.prepare("INSERT INTO nums VALUES (?, ?)").unwrap();
        let values: Vec<Value> = (1..=n)
            .flat_map(|v| [Value::Long(v % 2), Value::Long(v)])
            .collect();
        let counts = stmt.execute_batch(&values).unwrap();
        assert_eq!(counts.len() as i64, n);
    }

    #[test]
    fn test_scalar_called_once_per_row() {
        let mut db = memory_db();
        numbers_table(&db, 5);
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        db.register_function(
            "twice",
            Function::scalar(move |ctx| {
                counter.set(counter.get() + 1);
                let v = ctx.arg_long(0)?;
                ctx.result_long(v * 2)
            }),
        )
        .unwrap();

        assert_eq!(query_long(&db, "SELECT sum(twice(v)) FROM nums"), 30);
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn test_aggregate_steps_and_single_final() {
        let mut db = memory_db();
        numbers_table(&db, 4);
        let (sum, steps, finals) = sum_function();
        db.register_function("my_sum", sum).unwrap();

        assert_eq!(query_long(&db, "SELECT my_sum(v) FROM nums"), 10);
        assert_eq!(steps.get(), 4);
        assert_eq!(finals.get(), 1);
    }

    #[test]
    fn test_aggregate_groups_are_independent() {
        let mut db = memory_db();
        numbers_table(&db, 6);
        let (sum, steps, finals) = sum_function();
        db.register_function("my_sum", sum).unwrap();

        let mut stmt = db
            .prepare("SELECT grp, my_sum(v) FROM nums GROUP BY grp ORDER BY grp")
            .unwrap();
        let mut totals = Vec::new();
        while stmt.step().unwrap() {
            totals.push((stmt.column_long(0), stmt.column_long(1)));
        }
        assert_eq!(totals, [(0, 2 + 4 + 6), (1, 1 + 3 + 5)]);
        assert_eq!(steps.get(), 6);
        assert_eq!(finals.get(), 2);

        let record = db.functions.get("my_sum").unwrap();
        let RecordKind::Aggregate(state) = &record.kind else {
            panic!("expected aggregate record");
        };
        assert_eq!(state.live_instances(), 0);
    }

    #[test]
    fn test_aggregate_over_empty_input() {
        let mut db = memory_db();
        db.exec("CREATE TABLE empty(v INTEGER)").unwrap();
        let (sum, steps, finals) = sum_function();
        db.register_function("my_sum", sum).unwrap();

        assert_eq!(query_long(&db, "SELECT my_sum(v) FROM empty"), 0);
        assert_eq!(steps.get(), 0);
        assert_eq!(finals.get(), 1);
    }

    #[test]
    fn test_callback_error_fails_step() {
        let mut db = memory_db();
        db.register_function(
            "fail",
            Function::scalar(|_ctx| Err(Error::function("custom failure"))),
        )
        .unwrap();
        let mut stmt = db.prepare("SELECT fail()").unwrap();
        let err = stmt.step().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"custom failure");
    }

    #[test]
    fn test_aggregate_step_error_still_finalizes_once() {
        #[derive(Clone)]
        struct FailOnSecond {
            seen: usize,
            finals: Rc<Cell<usize>>,
        }

        impl AggregateFunction for FailOnSecond {
            fn step(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
                self.seen += 1;
                if self.seen == 2 {
                    return Err(Error::function("step failed"));
                }
                Ok(())
            }

            fn finish(&mut self, ctx: &mut Context<'_>) -> Result<()> {
                self.finals.set(self.finals.get() + 1);
                ctx.result_long(self.seen as i64)
            }
        }

        let mut db = memory_db();
        numbers_table(&db, 4);
        let finals = Rc::new(Cell::new(0));
        let prototype = FailOnSecond {
            seen: 0,
            finals: Rc::clone(&finals),
        };
        db.register_function("fail_second", Function::aggregate(prototype))
            .unwrap();

        let mut stmt = db.prepare("SELECT fail_second(v) FROM nums").unwrap();
        let err = stmt.step().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"step failed");
        drop(stmt);

        assert_eq!(finals.get(), 1);
        let record = db.functions.get("fail_second").unwrap();
        let RecordKind::Aggregate(state) = &record.kind else {
            panic!("expected aggregate record");
        };
        assert_eq!(state.live_instances(), 0);
    }

    #[test]
    fn test_out_of_memory_from_callback() {
        let mut db = memory_db();
        db.register_function(
            "starved",
            Function::scalar(|_ctx| Err(Error::OutOfMemory)),
        )
        .unwrap();
        let mut stmt = db.prepare("SELECT starved()").unwrap();
        assert!(matches!(stmt.step(), Err(Error::OutOfMemory)));
    }

    #[test]
    fn test_callback_panic_fails_step() {
        let mut db = memory_db();
        db.register_function("boom", Function::scalar(|_ctx| panic!("kaboom")))
            .unwrap();
        let mut stmt = db.prepare("SELECT boom()").unwrap();
        let err = stmt.step().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"user function 'boom' panicked: kaboom");

        // The connection stays usable.
        assert_eq!(query_long(&db, "SELECT 1"), 1);
    }

    #[test]
    fn test_final_arguments_are_unavailable() {
        #[derive(Clone)]
        struct PeekInFinal;

        impl AggregateFunction for PeekInFinal {
            fn step(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
                Ok(())
            }

            fn finish(&mut self, ctx: &mut Context<'_>) -> Result<()> {
                ctx.arg_long(0)?;
                ctx.result_null()
            }
        }

        let mut db = memory_db();
        db.register_function("peek", Function::aggregate(PeekInFinal)).unwrap();
        let mut stmt = db.prepare("SELECT peek(1)").unwrap();
        let err = stmt.step().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"not in value access state");
    }

    #[test]
    fn test_unregister_stops_routing() {
        let mut db = memory_db();
        db.register_function("one", Function::scalar(|ctx| ctx.result_int(1)))
            .unwrap();
        assert_eq!(query_long(&db, "SELECT one()"), 1);

        db.unregister_function("ONE").unwrap();
        assert!(db.functions.get("one").is_none());
        let Err(err) = db.prepare("SELECT one()") else {
            panic!("prepare should fail for an unregistered function");
        };
        insta::assert_snapshot!(err.to_string(), @"no such function: one");

        db.unregister_function("never_registered").unwrap();
    }

    #[test]
    fn test_reregister_replaces_function() {
        let mut db = memory_db();
        db.register_function("answer", Function::scalar(|ctx| ctx.result_int(1)))
            .unwrap();
        db.register_function("other", Function::scalar(|ctx| ctx.result_int(0)))
            .unwrap();
        let first = Rc::clone(db.functions.get("answer").unwrap());

        db.register_function("Answer", Function::scalar(|ctx| ctx.result_int(42)))
            .unwrap();
        assert!(first.retired.get());
        assert_eq!(query_long(&db, "SELECT answer()"), 42);
        assert_eq!(db.functions.names(), ["Answer", "other"]);
    }

    #[test]
    fn test_close_releases_every_record() {
        let mut db = memory_db();
        db.register_function("one", Function::scalar(|ctx| ctx.result_int(1)))
            .unwrap();
        let (sum, _, _) = sum_function();
        db.register_function("my_sum", sum).unwrap();

        let scalar = Rc::downgrade(db.functions.get("one").unwrap());
        let aggregate = Rc::downgrade(db.functions.get("my_sum").unwrap());
        db.close().unwrap();

        assert!(scalar.upgrade().is_none());
        assert!(aggregate.upgrade().is_none());
    }

    #[test]
    fn test_register_requires_open_connection() {
        let mut db = Database::new();
        let err = db
            .register_function("one", Function::scalar(|ctx| ctx.result_int(1)))
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
