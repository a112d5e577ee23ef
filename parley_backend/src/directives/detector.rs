use std::collections::HashSet;

use super::{scan, DirectiveKind, ScannedDirective};

/// A directive that became complete since the previous scan and should fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// `index` is the position of the query among all searches in the message.
    Search { index: usize, query: String },
    Image { prompt: String },
    Page { body: String },
    TextFile { name: Option<String>, body: String },
    TaskCreate { body: String },
    FunctionCall { body: String },
}

impl Detection {
    pub fn kind(&self) -> DirectiveKind {
        match self {
            Detection::Search { .. } => DirectiveKind::Search,
            Detection::Image { .. } => DirectiveKind::Image,
            Detection::Page { .. } => DirectiveKind::Page,
            Detection::TextFile { .. } => DirectiveKind::TextFile,
            Detection::TaskCreate { .. } => DirectiveKind::TaskCreate,
            Detection::FunctionCall { .. } => DirectiveKind::FunctionCall,
        }
    }

    fn from_scanned(directive: ScannedDirective) -> Self {
        match directive.kind {
            DirectiveKind::Search => Detection::Search {
                index: 0,
                query: directive.body,
            },
            DirectiveKind::Image => Detection::Image {
                prompt: directive.body,
            },
            DirectiveKind::Page => Detection::Page {
                body: directive.body,
            },
            DirectiveKind::TextFile => Detection::TextFile {
                name: directive.name,
                body: directive.body,
            },
            DirectiveKind::TaskCreate => Detection::TaskCreate {
                body: directive.body,
            },
            DirectiveKind::FunctionCall => Detection::FunctionCall {
                body: directive.body,
            },
        }
    }
}

/// Per-message detector. Re-scanning the growing buffer only reports
/// directives that have not fired yet: each non-search kind fires once per
/// message, and every complete search occurrence fires once in order.
#[derive(Debug, Default)]
pub struct DirectiveDetector {
    fired: HashSet<DirectiveKind>,
    searches_seen: usize,
}

impl DirectiveDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self, kind: DirectiveKind) -> bool {
        match kind {
            DirectiveKind::Search => self.searches_seen > 0,
            other => self.fired.contains(&other),
        }
    }

    pub fn scan(&mut self, buffer: &str) -> Vec<Detection> {
        let mut detections = Vec::new();
        let mut search_index = 0;

        for directive in scan(buffer).into_iter().filter(|d| d.complete) {
            if directive.body.is_empty() {
                continue;
            }
            match directive.kind {
                DirectiveKind::Search => {
                    if search_index >= self.searches_seen {
                        detections.push(Detection::Search {
                            index: search_index,
                            query: directive.body,
                        });
                    }
                    search_index += 1;
                }
                kind => {
                    if self.fired.insert(kind) {
                        detections.push(Detection::from_scanned(directive));
                    }
                }
            }
        }

        self.searches_seen = self.searches_seen.max(search_index);
        detections
    }
}
