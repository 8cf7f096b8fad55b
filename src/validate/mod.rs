//! Validation stage: casts, processing-time stamping and rule filtering.
//!
//! Records flow through three steps in order:
//! 1. `casts` derive typed columns; a failed cast yields `NULL`
//! 2. `_rescued_data` is removed
//! 3. every rule is evaluated, and a record violating any of them is dropped

mod rule;

pub use rule::{CompareOp, Expr, Operand, Rule, RuleSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::debug;

use crate::emit;
use crate::metrics::events::{CastFailures, RecordsDropped, RecordsRescued};
use crate::schema::FieldType;
use crate::value::{RESCUED_DATA_COLUMN, Record, Value};

/// Output of validating one batch.
#[derive(Debug, Default)]
pub struct ValidatedBatch {
    pub records: Vec<Record>,
    /// Records dropped for violating at least one rule.
    pub dropped: usize,
    /// Violations per rule name. A record can count towards several rules.
    pub violations: IndexMap<String, usize>,
    /// Records that carried rescued data.
    pub rescued: usize,
    /// Cast failures per column.
    pub cast_failures: IndexMap<String, usize>,
}

/// Per-entity validator.
#[derive(Debug, Clone)]
pub struct Validator {
    name: String,
    casts: IndexMap<String, FieldType>,
    processing_time_column: Option<String>,
    rules: RuleSet,
}

impl Validator {
    pub fn new(
        name: impl Into<String>,
        casts: IndexMap<String, FieldType>,
        processing_time_column: Option<String>,
        rules: RuleSet,
    ) -> Self {
        Self {
            name: name.into(),
            casts,
            processing_time_column,
            rules,
        }
    }

    /// Validate a batch stamped with a single processing time.
    pub fn validate(&self, records: Vec<Record>, processing_time: DateTime<Utc>) -> ValidatedBatch {
        let mut batch = ValidatedBatch {
            records: Vec::with_capacity(records.len()),
            ..Default::default()
        };

        for mut record in records {
            self.derive(&mut record, processing_time, &mut batch.cast_failures);

            if record
                .remove(RESCUED_DATA_COLUMN)
                .is_some_and(|rescued| !rescued.is_null())
            {
                batch.rescued += 1;
            }

            let violated = self.rules.violations(&record);
            if violated.is_empty() {
                batch.records.push(record);
                continue;
            }

            batch.dropped += 1;
            for index in violated {
                let rule = &self.rules.rules()[index];
                *batch.violations.entry(rule.name.clone()).or_default() += 1;
                debug!(
                    target = %self.name,
                    rule = %rule.name,
                    predicate = %rule.source,
                    "Record dropped by rule"
                );
            }
        }

        self.emit_metrics(&batch);
        batch
    }

    fn derive(
        &self,
        record: &mut Record,
        processing_time: DateTime<Utc>,
        failures: &mut IndexMap<String, usize>,
    ) {
        for (column, ty) in &self.casts {
            let current = record.value(column);
            let cast = match ty.cast(current) {
                Some(value) => value,
                None => {
                    *failures.entry(column.clone()).or_default() += 1;
                    Value::Null
                }
            };
            record.insert(column.clone(), cast);
        }

        if let Some(column) = &self.processing_time_column {
            record.insert(column.clone(), Value::Timestamp(processing_time));
        }
    }

    fn emit_metrics(&self, batch: &ValidatedBatch) {
        if batch.rescued > 0 {
            emit!(RecordsRescued {
                count: batch.rescued as u64,
                target: self.name.clone(),
            });
        }
        for (column, count) in &batch.cast_failures {
            emit!(CastFailures {
                count: *count as u64,
                column: column.clone(),
                target: self.name.clone(),
            });
        }
        for (rule, count) in &batch.violations {
            emit!(RecordsDropped {
                count: *count as u64,
                rule: rule.clone(),
                target: self.name.clone(),
            });
        }
    }
}
