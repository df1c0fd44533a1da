//! 按有效协议集合缓存安全上下文。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 重复建立连接时避免为每个连接重新构建 `SSL_CTX`；
//! - 不同身份的构建互不阻塞，因此不在构建期间持有整表锁。
//!
//! ## 逻辑（How）
//! - 命中直接返回共享上下文；
//! - 未命中时在锁外构建，再通过 `entry` 原子地“缺席才插入”；
//!   若另一构建者已先插入，则丢弃本次构建结果并返回胜者。
//!
//! ## 契约（What）
//! - 同一键在缓存中至多保留一个值；
//! - 落败的构建结果只在本函数内存在过，随即被释放，不会暴露给任何调用方。

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::alpn::ApplicationProtocolList;
use crate::connection::Role;
use crate::context::SecurityContext;
use crate::policy::{CipherSuitesPolicy, EncryptionPolicy};
use crate::protocols::SslProtocols;
use crate::settings::EngineSettings;

/// 以有效协议集合为键的上下文缓存。
pub struct ContextCache<T = SecurityContext> {
    entries: DashMap<SslProtocols, Arc<T>>,
}

impl<T> Default for ContextCache<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> ContextCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: SslProtocols) -> Option<Arc<T>> {
        self.entries.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// 查找或构建上下文。
    ///
    /// `build` 在未持有任何分片锁的情况下执行，构建失败时缓存保持不变。
    pub fn get_or_create<E>(
        &self,
        key: SslProtocols,
        build: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, E> {
        if let Some(hit) = self.get(key) {
            tracing::trace!(protocols = ?key, "ssl context cache hit");
            return Ok(hit);
        }

        let built = Arc::new(build()?);
        match self.entries.entry(key) {
            Entry::Occupied(winner) => {
                tracing::trace!(protocols = ?key, "ssl context cache race lost, discarding build");
                Ok(Arc::clone(winner.get()))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&built));
                Ok(built)
            }
        }
    }

    /// 清空缓存；已分发出去的上下文不受影响。
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// 一次连接请求是否允许使用缓存的上下文。
///
/// 仅在未禁用会话复用、要求加密、未使用自定义套件策略时缓存；
/// 服务端还要求存在候选协议，保证缓存的上下文总是带着 ALPN 回调。
pub fn is_cacheable(
    settings: &EngineSettings,
    role: Role,
    encryption: EncryptionPolicy,
    cipher_policy: Option<&CipherSuitesPolicy>,
    application_protocols: Option<&ApplicationProtocolList>,
) -> bool {
    if settings.disable_tls_resume
        || encryption != EncryptionPolicy::RequireEncryption
        || cipher_policy.is_some()
    {
        return false;
    }
    match role {
        Role::Client => true,
        Role::Server => application_protocols.is_some_and(|protocols| !protocols.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tracing_test::traced_test;

    /// 记录存活实例数量。
    struct Tracked {
        live: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self {
                live: Arc::clone(live),
            }
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn concurrent_builders_leave_one_survivor() {
        const THREADS: usize = 8;
        let cache = Arc::new(ContextCache::<Tracked>::new());
        let live = Arc::new(AtomicUsize::new(0));
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let live = Arc::clone(&live);
                let builds = Arc::clone(&builds);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_create(SslProtocols::TLS12, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, Infallible>(Tracked::new(&live))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<Tracked>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = &results[0];
        assert!(results.iter().all(|tracked| Arc::ptr_eq(tracked, first)));
        assert!(builds.load(Ordering::SeqCst) >= 1);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);

        drop(results);
        cache.clear();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_build_leaves_cache_untouched() {
        let cache = ContextCache::<u32>::new();
        let err = cache
            .get_or_create(SslProtocols::TLS13, || Err::<u32, _>("boom"))
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(cache.is_empty());
    }

    #[test]
    fn distinct_keys_are_cached_separately() {
        let cache = ContextCache::<u32>::new();
        let a = cache
            .get_or_create(SslProtocols::TLS12, || Ok::<_, Infallible>(12))
            .unwrap();
        let b = cache
            .get_or_create(SslProtocols::TLS13, || Ok::<_, Infallible>(13))
            .unwrap();
        assert_eq!((*a, *b), (12, 13));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    #[traced_test]
    fn hit_skips_builder_and_is_logged() {
        let cache = ContextCache::<u32>::new();
        cache
            .get_or_create(SslProtocols::empty(), || Ok::<_, Infallible>(1))
            .unwrap();
        let hit = cache
            .get_or_create(SslProtocols::empty(), || -> Result<u32, Infallible> {
                panic!("builder must not run on a cache hit")
            })
            .unwrap();
        assert_eq!(*hit, 1);
        assert!(logs_contain("ssl context cache hit"));
    }

    #[test]
    fn cacheability_rules() {
        let settings = EngineSettings::default();
        let protocols = ApplicationProtocolList::from_names(["h2"]).unwrap();
        let require = EncryptionPolicy::RequireEncryption;

        assert!(is_cacheable(&settings, Role::Client, require, None, None));
        assert!(!is_cacheable(&settings, Role::Server, require, None, None));
        assert!(is_cacheable(&settings, Role::Server, require, None, Some(&protocols)));
        assert!(!is_cacheable(
            &settings,
            Role::Client,
            EncryptionPolicy::AllowNoEncryption,
            None,
            None
        ));

        let policy = CipherSuitesPolicy::new(["TLS_AES_128_GCM_SHA256"]);
        assert!(!is_cacheable(&settings, Role::Client, require, Some(&policy), None));

        let disabled = EngineSettings::default().with_disable_tls_resume(true);
        assert!(!is_cacheable(&disabled, Role::Client, require, None, None));
    }
}
