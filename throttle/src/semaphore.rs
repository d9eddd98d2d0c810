use std::sync::Arc;

/// Optional semaphore: `None` means the resource is not limited and every call returns at once.
#[derive(Clone, Debug, Default)]
pub struct Semaphore {
    sem: Option<Arc<tokio::sync::Semaphore>>,
}

/// Largest permit count tokio accepts, bigger limits are clamped to it.
pub const MAX_PERMITS: usize = tokio::sync::Semaphore::MAX_PERMITS;

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        if permits == 0 {
            return Self::default();
        }
        Self {
            sem: Some(Arc::new(tokio::sync::Semaphore::new(permits.min(MAX_PERMITS)))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sem.is_some()
    }

    pub fn available_permits(&self) -> Option<usize> {
        self.sem.as_ref().map(|sem| sem.available_permits())
    }

    pub async fn acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        match &self.sem {
            // the semaphore is never closed, acquire only fails after close()
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    pub async fn consume(&self) {
        if let Some(sem) = &self.sem
            && let Ok(permit) = sem.acquire().await
        {
            permit.forget();
        }
    }

    pub fn top_up(&self, target: usize) {
        if let Some(sem) = &self.sem {
            let curr_permits = sem.available_permits();
            let target = target.min(MAX_PERMITS);
            if curr_permits < target {
                sem.add_permits(target - curr_permits);
            }
        }
    }
}
