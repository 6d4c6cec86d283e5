// src/utils/logbook.rs
//! JSON-lines export of joined events in the dsjson layout.

use std::{
    fs,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::protocol::event::OutcomeValue;
use crate::services::joined_event::{InteractionRecord, OutcomeRecord, ProblemData};
use crate::utils::timestamp::to_iso_millis;

pub struct DsJsonLog {
    out: Box<dyn Write + Send>,
    lines: u64,
}

impl DsJsonLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let f = fs::File::create(path)
            .with_context(|| format!("creating dsjson output {}", path.display()))?;
        Ok(Self::from_writer(Box::new(BufWriter::new(f))))
    }

    pub fn from_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out, lines: 0 }
    }

    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    /// Writes one line for a CB or CA interaction. Other shapes are skipped.
    pub fn append_joined(&mut self, rec: &InteractionRecord) -> Result<bool> {
        let Some(line) = dsjson_line(rec) else {
            return Ok(false);
        };
        let json = serde_json::to_string(&line)?;
        writeln!(self.out, "{}", json)?;
        self.lines += 1;
        Ok(true)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("flushing dsjson output")
    }
}

fn outcome_json(o: &OutcomeRecord) -> Value {
    let v = match &o.value {
        Some(OutcomeValue::Numeric(n)) => json!(n),
        Some(OutcomeValue::Literal(s)) => json!(s),
        None => Value::Null,
    };
    json!({
        "v": v,
        "EventId": o.event_id,
        "ActionTaken": o.action_taken,
    })
}

// Non-JSON contexts are carried as a string.
fn context_json(rec: &InteractionRecord) -> Value {
    serde_json::from_slice(&rec.context)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&rec.context).into_owned()))
}

pub fn dsjson_line(rec: &InteractionRecord) -> Option<Value> {
    let meta = &rec.metadata;
    let mut line = match &rec.problem_data {
        ProblemData::Cb(cb) => {
            let action = cb.actions.first().copied().unwrap_or(0);
            let label_p = cb.probabilities.first().copied().unwrap_or(0.0) * meta.pass_probability;
            json!({
                "_label_cost": -cb.reward,
                "_label_probability": label_p,
                "_label_Action": action,
                "_labelIndex": action.saturating_sub(1),
                "a": cb.actions,
                "p": cb.probabilities,
                "_original_label_cost": -cb.original_reward,
                "pdrop": cb.probability_of_drop,
                "_skipLearn": cb.skip_learn,
            })
        }
        ProblemData::Ca(ca) => json!({
            "_label_cost": -ca.reward,
            "_label_probability": ca.pdf_value,
            "_label_Action": ca.action,
            "_original_label_cost": -ca.original_reward,
            "pdrop": ca.probability_of_drop,
            "_skipLearn": ca.skip_learn,
        }),
        ProblemData::Ccb(_) | ProblemData::Slates(_) => return None,
    };
    let obj = line.as_object_mut()?;
    obj.insert(
        "o".into(),
        Value::Array(rec.outcomes.iter().map(outcome_json).collect()),
    );
    obj.insert("Timestamp".into(), json!(to_iso_millis(&rec.timestamp)));
    obj.insert("Version".into(), json!("1"));
    obj.insert("EventId".into(), json!(meta.event_id));
    obj.insert("c".into(), context_json(rec));
    obj.insert("VWState".into(), json!({ "m": rec.model_id }));
    Some(line)
}
