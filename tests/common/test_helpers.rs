use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate::rate_limit::{BucketSpec, InMemorySharedStore, SharedStore, TokenGrant};

/// Store whose every operation fails, as if the server were unreachable.
#[derive(Debug, Default)]
pub struct DownStore;

fn down() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "store unreachable")
}

#[async_trait]
impl SharedStore for DownStore {
    type Error = io::Error;

    async fn get_counter(&self, _key: &str) -> Result<Option<u64>, io::Error> {
        Err(down())
    }
    async fn set_counter(&self, _key: &str, _value: u64, _ttl: Duration) -> Result<(), io::Error> {
        Err(down())
    }
    async fn incr(&self, _key: &str) -> Result<u64, io::Error> {
        Err(down())
    }
    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, io::Error> {
        Err(down())
    }
    async fn field_count(&self, _key: &str) -> Result<u64, io::Error> {
        Err(down())
    }
    async fn field_names(&self, _key: &str) -> Result<Vec<String>, io::Error> {
        Err(down())
    }
    async fn set_field_if_absent(&self, _key: &str, _field: &str, _value: &str) -> Result<bool, io::Error> {
        Err(down())
    }
    async fn expire_field(&self, _key: &str, _field: &str, _ttl: Duration) -> Result<(), io::Error> {
        Err(down())
    }
    async fn field_ttl(&self, _key: &str, _field: &str) -> Result<Option<Duration>, io::Error> {
        Err(down())
    }
    async fn remove_field(&self, _key: &str, _field: &str) -> Result<(), io::Error> {
        Err(down())
    }
    async fn take_token(&self, _key: &str, _spec: BucketSpec) -> Result<TokenGrant, io::Error> {
        Err(down())
    }
}

/// In-memory store that counts calls and can be told to fail `expire_field`.
#[derive(Debug, Clone, Default)]
pub struct SpyStore {
    pub inner: InMemorySharedStore,
    pub calls: Arc<AtomicUsize>,
    pub fail_expire: Arc<AtomicBool>,
}

impl SpyStore {
    pub fn new(inner: InMemorySharedStore) -> Self {
        Self { inner, ..Self::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SharedStore for SpyStore {
    type Error = io::Error;

    async fn get_counter(&self, key: &str) -> Result<Option<u64>, io::Error> {
        self.touch();
        Ok(self.inner.get_counter(key).await.unwrap_or_default())
    }
    async fn set_counter(&self, key: &str, value: u64, ttl: Duration) -> Result<(), io::Error> {
        self.touch();
        let _ = self.inner.set_counter(key, value, ttl).await;
        Ok(())
    }
    async fn incr(&self, key: &str) -> Result<u64, io::Error> {
        self.touch();
        Ok(self.inner.incr(key).await.unwrap_or_default())
    }
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, io::Error> {
        self.touch();
        Ok(self.inner.ttl(key).await.unwrap_or_default())
    }
    async fn field_count(&self, key: &str) -> Result<u64, io::Error> {
        self.touch();
        Ok(self.inner.field_count(key).await.unwrap_or_default())
    }
    async fn field_names(&self, key: &str) -> Result<Vec<String>, io::Error> {
        self.touch();
        Ok(self.inner.field_names(key).await.unwrap_or_default())
    }
    async fn set_field_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool, io::Error> {
        self.touch();
        Ok(self.inner.set_field_if_absent(key, field, value).await.unwrap_or_default())
    }
    async fn expire_field(&self, key: &str, field: &str, ttl: Duration) -> Result<(), io::Error> {
        self.touch();
        if self.fail_expire.load(Ordering::SeqCst) {
            return Err(down());
        }
        let _ = self.inner.expire_field(key, field, ttl).await;
        Ok(())
    }
    async fn field_ttl(&self, key: &str, field: &str) -> Result<Option<Duration>, io::Error> {
        self.touch();
        Ok(self.inner.field_ttl(key, field).await.unwrap_or_default())
    }
    async fn remove_field(&self, key: &str, field: &str) -> Result<(), io::Error> {
        self.touch();
        let _ = self.inner.remove_field(key, field).await;
        Ok(())
    }
    async fn take_token(&self, key: &str, spec: BucketSpec) -> Result<TokenGrant, io::Error> {
        self.touch();
        match self.inner.take_token(key, spec).await {
            Ok(grant) => Ok(grant),
            Err(never) => match never {},
        }
    }
}
