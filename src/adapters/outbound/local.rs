use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    application::{
        expenses::ExpenseBook,
        registry::{ContinuationRegistry, accept_callback},
    },
    core::{
        domain::{Action, ContinuationToken},
        error::Result,
        ports::ExpenseGateway,
    },
};

/// Gateway that talks to the in-process expense book and registry directly.
pub struct LocalExpenseGateway {
    book: Arc<ExpenseBook>,
    registry: Arc<ContinuationRegistry>,
}

impl LocalExpenseGateway {
    pub fn new(book: Arc<ExpenseBook>, registry: Arc<ContinuationRegistry>) -> Self {
        Self { book, registry }
    }
}

#[async_trait]
impl ExpenseGateway for LocalExpenseGateway {
    async fn create_expense(&self, id: &str) -> Result<()> {
        self.book.create(id)
    }

    async fn register_callback(&self, id: &str, token: &ContinuationToken) -> Result<()> {
        accept_callback(&self.book, &self.registry, id, token.clone())
    }

    async fn request_payment(&self, id: &str) -> Result<()> {
        self.book.apply_action(id, Action::Payment).map(|_| ())
    }
}
