//! Autonomous resolution of decision steps.
//!
//! A [`DecisionPolicy`] scores an answer between 0 and 1. The interpreter
//! compares the score against its threshold and escalates below it, so the
//! scoring method is swappable without touching the run loop.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

use crate::error::{io_error, Result};
use crate::services::{WorkerContext, WorkerPool};

/// Role invoked for worker-generated answers.
pub const DECIDER_ROLE: &str = "decider";
/// Guidance matches at or above this score skip the worker entirely.
pub const GUIDANCE_SHORT_CIRCUIT: f64 = 0.9;
/// Score of a guidance section whose keywords all match.
pub const FULL_MATCH_SCORE: f64 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub project_id: String,
    pub workflow: String,
    pub step_index: usize,
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Guidance,
    Worker,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub answer: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub source: DecisionSource,
}

impl Decision {
    pub fn new(answer: impl Into<String>, confidence: f64, source: DecisionSource) -> Self {
        Self {
            answer: Some(answer.into()),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: String::new(),
            source,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// No answer at all. Always escalates.
    pub fn unresolved(reasoning: impl Into<String>) -> Self {
        Self {
            answer: None,
            confidence: 0.0,
            reasoning: reasoning.into(),
            source: DecisionSource::Unresolved,
        }
    }

    /// Whether the decision may be applied without asking a human.
    pub fn is_confident(&self, threshold: f64) -> bool {
        self.answer.is_some() && self.confidence >= threshold
    }
}

#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision>;
}

/// One `## keyword, keyword` section of a guidance document.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceEntry {
    pub heading: String,
    pub keywords: Vec<String>,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceMatch {
    pub heading: String,
    pub answer: String,
    pub score: f64,
}

/// Project guidance in markdown.
///
/// Each level-two heading lists comma-separated keywords; the first
/// non-empty line under it is the answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuidanceDocument {
    entries: Vec<GuidanceEntry>,
}

impl GuidanceDocument {
    pub fn parse(markdown: &str) -> Self {
        let mut entries = Vec::new();
        let mut current: Option<(String, Vec<String>)> = None;

        let mut close = |section: Option<(String, Vec<String>)>| {
            if let Some((heading, body)) = section {
                let keywords: Vec<String> = heading
                    .split(',')
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                let answer = body
                    .iter()
                    .map(|l| l.trim())
                    .find(|l| !l.is_empty())
                    .unwrap_or_default()
                    .to_string();
                if !keywords.is_empty() && !answer.is_empty() {
                    entries.push(GuidanceEntry {
                        heading,
                        keywords,
                        answer,
                    });
                }
            }
        };

        for line in markdown.lines() {
            if let Some(heading) = line.strip_prefix("## ") {
                close(current.take());
                current = Some((heading.trim().to_string(), Vec::new()));
            } else if line.starts_with('#') {
                close(current.take());
            } else if let Some((_, body)) = current.as_mut() {
                body.push(line.to_string());
            }
        }
        close(current);

        Self { entries }
    }

    /// Read a guidance file. A missing file means no guidance.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(Self::parse(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", path, e)),
        }
    }

    pub fn entries(&self) -> &[GuidanceEntry] {
        &self.entries
    }

    /// Best-scoring section for a question, if any keyword matched.
    pub fn lookup(&self, question: &str) -> Option<GuidanceMatch> {
        let question = question.to_lowercase();
        self.entries
            .iter()
            .filter_map(|entry| {
                let matched = entry
                    .keywords
                    .iter()
                    .filter(|k| question.contains(k.as_str()))
                    .count();
                if matched == 0 {
                    return None;
                }
                let score = FULL_MATCH_SCORE * matched as f64 / entry.keywords.len() as f64;
                Some(GuidanceMatch {
                    heading: entry.heading.clone(),
                    answer: entry.answer.clone(),
                    score,
                })
            })
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// Guidance first, then a `decider` worker, then the best partial guidance.
pub struct GuidanceFirstPolicy {
    guidance: Option<GuidanceDocument>,
    workers: Option<Arc<dyn WorkerPool>>,
}

impl GuidanceFirstPolicy {
    pub fn new() -> Self {
        Self {
            guidance: None,
            workers: None,
        }
    }

    pub fn with_guidance(mut self, guidance: GuidanceDocument) -> Self {
        self.guidance = Some(guidance);
        self
    }

    pub fn with_workers(mut self, workers: Arc<dyn WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    async fn ask_worker(&self, workers: &dyn WorkerPool, request: &DecisionRequest) -> Result<Decision> {
        let mut params = BTreeMap::new();
        params.insert("question".to_string(), Value::from(request.question.clone()));
        params.insert("options".to_string(), json!(request.options));
        let context = WorkerContext::new(&request.project_id, &request.workflow, request.step_index)
            .with_params(params);

        let output = workers.invoke(DECIDER_ROLE, &request.question, &context).await?;
        let reasoning = output.reasoning.unwrap_or_default();
        let Some(answer) = output.answer.filter(|a| !a.trim().is_empty()) else {
            return Ok(Decision::unresolved("decision worker returned no answer"));
        };

        let mut confidence = output.confidence.unwrap_or(0.0);
        if !request.options.is_empty()
            && !request
                .options
                .iter()
                .any(|o| o.eq_ignore_ascii_case(answer.trim()))
        {
            // An answer outside the offered options cannot be applied unattended.
            confidence = 0.0;
        }

        Ok(Decision::new(answer.trim(), confidence, DecisionSource::Worker).with_reasoning(reasoning))
    }
}

impl Default for GuidanceFirstPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionPolicy for GuidanceFirstPolicy {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision> {
        let guidance = self
            .guidance
            .as_ref()
            .and_then(|g| g.lookup(&request.question));

        if let Some(found) = &guidance {
            if found.score >= GUIDANCE_SHORT_CIRCUIT {
                debug!(step = request.step_index, heading = %found.heading, "Decision answered by guidance");
                return Ok(Decision::new(&found.answer, found.score, DecisionSource::Guidance)
                    .with_reasoning(format!("guidance section '{}'", found.heading)));
            }
        }

        if let Some(workers) = &self.workers {
            return self.ask_worker(workers.as_ref(), request).await;
        }

        Ok(match guidance {
            Some(found) => Decision::new(&found.answer, found.score, DecisionSource::Guidance)
                .with_reasoning(format!("partial match on guidance section '{}'", found.heading)),
            None => Decision::unresolved("no guidance matched and no decision worker is available"),
        })
    }
}
