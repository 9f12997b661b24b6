/// Owned dynamically typed [`Future`](std::future::Future), used at trait
/// boundaries where the concrete future type cannot be named.
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;
