use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per chat id so messages for the same chat are handled one at a time.
#[derive(Clone, Default)]
pub struct ChatLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ChatLocks {
    pub async fn acquire(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(chat_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_chat_is_serialized() {
        let locks = ChatLocks::default();
        let guard = locks.acquire("a@c.us").await;
        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire("a@c.us").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_chats_do_not_block() {
        let locks = ChatLocks::default();
        let _a = locks.acquire("a@c.us").await;
        tokio::time::timeout(Duration::from_millis(100), locks.acquire("b@c.us"))
            .await
            .unwrap();
    }
}
