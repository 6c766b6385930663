pub(crate) mod allocator;
pub(crate) mod arena;
pub(crate) mod error;
pub(crate) mod free_list;
pub(crate) mod pool;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod system;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
