//! Trace correlation: maps a trace id to a viewer URL.

use crate::domain::TraceId;

const PLACEHOLDER: &str = "{trace_id}";

#[derive(Debug, Clone)]
pub struct TraceLinkBuilder {
    template: String,
}

impl TraceLinkBuilder {
    /// `template` must contain `{trace_id}`.
    pub fn new(template: impl Into<String>) -> Option<Self> {
        let template = template.into();
        template
            .contains(PLACEHOLDER)
            .then_some(Self { template })
    }

    pub fn link(&self, trace_id: &TraceId) -> String {
        self.template.replace(PLACEHOLDER, trace_id.as_str())
    }

    pub fn link_opt(&self, trace_id: Option<&TraceId>) -> Option<String> {
        trace_id.map(|t| self.link(t))
    }
}
