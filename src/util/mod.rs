pub mod assert;
pub mod async_queue;
pub mod backoff;
pub mod base64;

pub use assert::{fail, hard_assert};
pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::{Backoff, BackoffSettings, ExponentialBackoff};

#[cfg(not(target_arch = "wasm32"))]
pub type BoxedFuture<'a, T> = futures::future::BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type BoxedFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;

/// `Send` on native targets, unconstrained on wasm.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSend: Send {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send> MaybeSend for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSend {}
#[cfg(target_arch = "wasm32")]
impl<T> MaybeSend for T {}

pub fn box_future<'a, F, T>(future: F) -> BoxedFuture<'a, T>
where
    F: std::future::Future<Output = T> + MaybeSend + 'a,
{
    Box::pin(future)
}
