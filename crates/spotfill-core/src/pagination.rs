//! Token-driven pagination over inventory listings.

use crate::inventory::Page;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, Stream, TryStreamExt};

enum Cursor {
    Start,
    Next(String),
    Exhausted,
}

impl Cursor {
    fn after(next_token: Option<String>) -> Self {
        match next_token {
            Some(token) if !token.is_empty() => Cursor::Next(token),
            _ => Cursor::Exhausted,
        }
    }
}

/// Stream every page produced by `fetch`, feeding each continuation token back in.
/// The stream ends after the first page without a token or after the first error.
pub fn pages<'a, T, E, F>(fetch: F) -> impl Stream<Item = Result<Vec<T>, E>> + 'a
where
    F: Fn(Option<String>) -> BoxFuture<'a, Result<Page<T>, E>> + 'a,
    T: 'a,
    E: 'a,
{
    stream::unfold((Cursor::Start, fetch), |(cursor, fetch)| async move {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Exhausted => return None,
        };

        match fetch(token).await {
            Ok(page) => Some((Ok(page.items), (Cursor::after(page.next_token), fetch))),
            Err(e) => Some((Err(e), (Cursor::Exhausted, fetch))),
        }
    })
}

/// Concatenate every page in order.
pub async fn collect_all<'a, T, E, F>(fetch: F) -> Result<Vec<T>, E>
where
    F: Fn(Option<String>) -> BoxFuture<'a, Result<Page<T>, E>> + 'a,
    T: 'a,
    E: 'a,
{
    pages(fetch).try_concat().await
}
