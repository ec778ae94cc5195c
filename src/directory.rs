use crate::{
    account::AccountId,
    storage::{Storage, StorageError},
};

/// Answers whether an account exists.
///
/// `Ok(false)` means the lookup succeeded and found nothing; a failed lookup is always an
/// `Err`, never a `false`.
pub struct AccountDirectory<'s, S> {
    storage: &'s S,
}

impl<'s, S: Storage> AccountDirectory<'s, S> {
    pub fn new(storage: &'s S) -> Self {
        Self { storage }
    }

    pub async fn exists(&self, account: AccountId) -> Result<bool, StorageError> {
        self.storage.account_exists(account).await
    }
}
