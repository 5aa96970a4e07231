//! Cursor pagination helper.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{AppError, Result};

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Fetch pages until the peer stops returning a cursor, concatenating the
/// items in page order.
///
/// Stops early when `cancel` fires or a page fetch fails. The loop is
/// unbounded otherwise, so a peer that never stops returning cursors must
/// be cut off through `cancel`.
///
/// # Errors
///
/// - [`AppError::Cancelled`] when `cancel` fires between pages.
/// - Any error returned by `fetch`.
pub async fn fetch_all<T, F, Fut>(cancel: &CancellationToken, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut cursor = None;
    let mut pages = 0_usize;

    loop {
        let page = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!(
                    "pagination cancelled after {pages} pages"
                )));
            }
            page = fetch(cursor.take()) => page?,
        };

        pages += 1;
        items.extend(page.items);

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    debug!(pages, items = items.len(), "pagination complete");
    Ok(items)
}
