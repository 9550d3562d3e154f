//!
//! Statement execution: one-shot, update, and batched.
//!

use litebridge_core::{Error, Result, Value};

use crate::statement::Statement;

impl Statement {
    /// Rewinds the statement, binds `values` to positions
    /// `1..=values.len()` and steps once.
    ///
    /// Returns `true` when the step produced a row. The statement is left
    /// positioned on that row until the next call rewinds it, so the same
    /// statement can be executed repeatedly without an explicit `reset`.
    ///
    /// # Panics
    ///
    /// If `values.len()` differs from the statement's parameter count.
    pub fn execute(&mut self, values: &[Value]) -> Result<bool> {
        assert_eq!(
            values.len(),
            self.parameter_count(),
            "execute: value count does not match parameter count"
        );
        // A failed step has already reset; any status here repeats it.
        self.reset_quietly();
        self.bind_all(values)?;
        self.step()
    }

    /// Executes a statement that must not produce rows and returns the
    /// number of rows it changed. The statement is reset either way.
    pub fn execute_update(&mut self, values: &[Value]) -> Result<i32> {
        if self.execute(values)? {
            self.reset_quietly();
            return Err(Error::QueryReturnedRows);
        }
        let changes = self.connection().changes()?;
        self.reset_quietly();
        Ok(changes)
    }

    /// Runs the statement once per group of `parameter_count` values and
    /// returns the change count of each run.
    ///
    /// Stops at the first group that fails or yields a row, returning
    /// `Error::Batch` with counts for the groups that completed and zeros
    /// from the failing group onward. Completed groups are not rolled back.
    ///
    /// # Panics
    ///
    /// If the statement has no parameters, or `values.len()` is not a
    /// multiple of the parameter count.
    pub fn execute_batch(&mut self, values: &[Value]) -> Result<Vec<i32>> {
        let params = self.parameter_count();
        assert!(params > 0, "execute_batch: statement has no parameters");
        assert!(
            values.len() % params == 0,
            "execute_batch: {} values do not divide into groups of {params}",
            values.len()
        );

        let groups = values.len() / params;
        let mut update_counts = vec![0; groups];
        for (index, group) in values.chunks_exact(params).enumerate() {
            if let Err(source) = self.run_group(group) {
                self.reset_quietly();
                tracing::debug!(index, error = %source, "batch stopped");
                return Err(Error::Batch {
                    index,
                    update_counts,
                    source: Box::new(source),
                });
            }
            update_counts[index] = self.connection().changes()?;
        }
        self.reset_quietly();
        Ok(update_counts)
    }

    fn run_group(&mut self, group: &[Value]) -> Result<()> {
        self.reset()?;
        self.bind_all(group)?;
        if self.step()? {
            return Err(Error::QueryReturnedRows);
        }
        Ok(())
    }
}
