//! Marker-paginated listing of containers and objects.
//!
//! Swift caps every listing response (10,000 names by default) and reports the total number of
//! names in a response header.  A full listing is assembled by repeatedly asking for the names
//! after the last name seen so far, until as many names as the first response declared have been
//! accumulated.
use crate::objstore::{AuthToken, ListingPage, SourceStorage};
use crate::Result;
use std::future::Future;
use tracing::{debug, instrument, warn};

/// The fully materialized listing of a container or an account
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listing {
    /// Every name, in ascending order and without duplicates
    pub names: Vec<String>,

    /// The total declared by the store in the first response
    pub declared_total: usize,

    /// How many page requests it took to assemble the listing
    pub requests: usize,
}

/// List every object in `container`
#[instrument(skip(source, token))]
pub async fn list_all_objects(
    source: &dyn SourceStorage,
    token: &AuthToken,
    container: &str,
    max_stalled_pages: usize,
) -> Result<Listing> {
    list_all(container, max_stalled_pages, |marker| async move {
        source
            .list_object_page(token, container, marker.as_deref())
            .await
    })
    .await
}

/// List every container in the account
#[instrument(skip(source, token))]
pub async fn list_all_containers(
    source: &dyn SourceStorage,
    token: &AuthToken,
    max_stalled_pages: usize,
) -> Result<Listing> {
    list_all("<account>", max_stalled_pages, |marker| async move {
        source.list_container_page(token, marker.as_deref()).await
    })
    .await
}

/// Assemble a full listing from pages produced by `fetch_page`.
///
/// `fetch_page` is called with `None` for the first page and with the last accumulated name
/// after that.  The total declared by the first page is authoritative; the listing is complete
/// once at least that many names are accumulated.
///
/// The store is expected to return only names strictly greater than the marker.  Any name that
/// isn't is dropped, so the result never contains duplicates.  If `max_stalled_pages` requests in
/// a row yield no new names while the listing is still short, the listing fails with
/// [`crate::ColdVaultError::ListStalled`] rather than asking again forever.
pub(crate) async fn list_all<F, Fut>(
    scope: &str,
    max_stalled_pages: usize,
    mut fetch_page: F,
) -> Result<Listing>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<ListingPage>>,
{
    let ListingPage {
        names: first_names,
        declared_total,
    } = fetch_page(None).await?;
    let mut requests = 1usize;

    let mut names: Vec<String> = Vec::with_capacity(declared_total.max(first_names.len()));
    let mut stalled_pages = 0usize;

    if accept_page(&mut names, first_names) == 0 && declared_total > 0 {
        stalled_pages += 1;
    }

    debug!(
        scope,
        declared_total,
        first_page = names.len(),
        "Received first listing page"
    );

    while names.len() < declared_total {
        if stalled_pages >= max_stalled_pages.max(1) {
            warn!(
                scope,
                accumulated = names.len(),
                declared_total,
                requests,
                "Listing is not converging"
            );

            return crate::error::ListStalledSnafu {
                scope,
                accumulated: names.len(),
                declared_total,
                requests,
            }
            .fail();
        }

        let marker = names.last().cloned();
        let page = fetch_page(marker).await?;
        requests += 1;

        if page.declared_total != declared_total {
            // The container is being written to while we list it.  The first snapshot stays
            // authoritative.
            debug!(
                scope,
                declared_total,
                current_total = page.declared_total,
                "Declared total changed during listing"
            );
        }

        if accept_page(&mut names, page.names) == 0 {
            stalled_pages += 1;
            debug!(
                scope,
                stalled_pages,
                accumulated = names.len(),
                "Listing page contained no new names"
            );
        } else {
            stalled_pages = 0;
        }
    }

    debug!(
        scope,
        count = names.len(),
        requests,
        "Listing completed"
    );

    Ok(Listing {
        names,
        declared_total,
        requests,
    })
}

/// Append the names from a page which sort after everything accumulated so far.
///
/// Returns how many names were accepted.
fn accept_page(names: &mut Vec<String>, page: Vec<String>) -> usize {
    let before = names.len();

    for name in page {
        if names.last().map_or(true, |last| name > *last) {
            names.push(name);
        }
    }

    names.len() - before
}
