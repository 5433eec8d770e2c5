//! Boxed future returned across trait seams

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Boxed, sendable future with combinator chaining.
///
/// Trait methods return this instead of `impl Future` so that implementations
/// stay object safe.
pub struct AsyncTask<T> {
    fut: Pin<Box<dyn Future<Output = T> + Send + 'static>>,
}

impl<T> AsyncTask<T> {
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self { fut: Box::pin(fut) }
    }

    /// Already completed task.
    pub fn ready(value: T) -> Self
    where
        T: Send + 'static,
    {
        Self::from_future(std::future::ready(value))
    }

    /// Map the output once the task completes.
    pub fn map<U, F>(self, f: F) -> AsyncTask<U>
    where
        F: FnOnce(T) -> U + Send + 'static,
        T: 'static,
        U: 'static,
    {
        let fut = self.fut;
        AsyncTask::from_future(async move { f(fut.await) })
    }
}

impl<T> Future for AsyncTask<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.fut.as_mut().poll(cx)
    }
}
