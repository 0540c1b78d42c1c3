//! Display filters. Filtering reads the collection and never changes it.

use crate::models::{Event, Lead, ReporterFilter};

/// Selects which rows are displayed.
pub trait ViewFilter<R> {
    fn matches(&self, record: &R) -> bool;
}

/// Rows of `records` selected by `filter`, in their original order.
pub fn filter<'a, R, F>(records: impl IntoIterator<Item = &'a R>, filter: &F) -> Vec<R>
where
    R: Clone + 'a,
    F: ViewFilter<R> + ?Sized,
{
    records
        .into_iter()
        .filter(|record| filter.matches(record))
        .cloned()
        .collect()
}

/// Lead board search box: a case-insensitive title match, or the term appearing in the
/// reporter name or the status label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadSearch {
    term: String,
}

impl LeadSearch {
    pub fn new(term: impl Into<String>) -> Self {
        Self { term: term.into() }
    }

    pub fn term(&self) -> &str {
        &self.term
    }
}

impl ViewFilter<Lead> for LeadSearch {
    fn matches(&self, lead: &Lead) -> bool {
        if self.term.is_empty() {
            return true;
        }
        lead.title.to_lowercase().contains(&self.term.to_lowercase())
            || lead.reporter.name().contains(&self.term)
            || lead.status.label().contains(&self.term)
    }
}

impl ViewFilter<Event> for ReporterFilter {
    fn matches(&self, event: &Event) -> bool {
        ReporterFilter::matches(self, event.reporter)
    }
}
