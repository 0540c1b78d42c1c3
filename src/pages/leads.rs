//! Lead board: the collaborative list of leads with search and per-row edit rights.

use std::sync::Arc;

use super::{PageCore, PageEvent};
use crate::auth::{can_edit_or_delete, SessionContext};
use crate::errors::{messages, ErrorSurface, SyncError, UserAction};
use crate::models::{Lead, LeadPatch, NewLead};
use crate::reconciler::{filter, Collection, LeadSearch};

pub struct LeadBoard {
    core: PageCore<Lead>,
    session: Arc<SessionContext>,
    search: LeadSearch,
}

impl LeadBoard {
    /// Open the board for the signed-in user.
    pub async fn open(session: Arc<SessionContext>) -> Result<Self, SyncError> {
        if !session.is_logged_in() {
            return Err(SyncError::Auth("User not authenticated".to_string()));
        }
        let core = PageCore::open(session.backend(), UserAction::LoadLeads).await?;

        Ok(Self {
            core,
            session,
            search: LeadSearch::default(),
        })
    }

    /// Every lead, newest first.
    pub fn leads(&self) -> &Collection<Lead> {
        self.core.collection()
    }

    pub fn get(&self, id: &str) -> Option<&Lead> {
        self.core.get(id)
    }

    /// Leads matching the search box.
    pub fn visible(&self) -> Vec<Lead> {
        filter(self.core.collection().iter(), &self.search)
    }

    pub fn set_search(&mut self, term: impl Into<String>) {
        self.search = LeadSearch::new(term);
    }

    pub fn search(&self) -> &str {
        self.search.term()
    }

    /// Whether the edit and delete buttons are offered for `lead`.
    pub fn can_edit(&self, lead: &Lead) -> bool {
        can_edit_or_delete(lead, self.session.current_user().as_ref())
    }

    /// Values the dialog opens with: the lead's own, or the defaults for a new one.
    pub fn form_for(&self, id: Option<&str>) -> NewLead {
        id.and_then(|id| self.get(id))
            .map(Lead::to_form)
            .unwrap_or_default()
    }

    /// Dialog save. `editing` is the lead being edited, `None` for a new lead.
    pub async fn save(&mut self, editing: Option<&str>, form: NewLead) -> Result<Lead, ErrorSurface> {
        match editing {
            None => {
                self.core
                    .create(&form.normalized(), UserAction::SaveLead)
                    .await
            }
            Some(id) => {
                self.authorize(id)?;
                self.core
                    .save(id, LeadPatch::from_form(form), UserAction::SaveLead)
                    .await
            }
        }
    }

    /// Delete from the list. The row disappears at once; failures come back through
    /// `next_event`.
    pub fn delete(&mut self, id: &str) -> Result<(), ErrorSurface> {
        self.authorize(id)?;
        self.core.delete_in_background(id, UserAction::DeleteLead)
    }

    pub async fn next_event(&mut self) -> PageEvent {
        self.core.next_event().await
    }

    /// The banner's reload action.
    pub async fn reload(&mut self) -> Result<(), ErrorSurface> {
        self.core.reload().await
    }

    pub fn error(&self) -> Option<&ErrorSurface> {
        self.core.error()
    }

    pub fn clear_error(&mut self) {
        self.core.clear_error();
    }

    pub fn teardown(&mut self) {
        self.core.teardown();
    }

    fn authorize(&self, id: &str) -> Result<(), ErrorSurface> {
        let lead = self.get(id).ok_or(ErrorSurface::Silent)?;
        if self.can_edit(lead) {
            return Ok(());
        }
        tracing::info!(id = %id, "Edit of lead denied locally");
        Err(ErrorSurface::AccessDenied {
            message: messages::ACCESS_DENIED.to_string(),
        })
    }
}

impl Drop for LeadBoard {
    fn drop(&mut self) {
        self.teardown();
    }
}
