//! Bookmark command handlers

use anyhow::{bail, Context, Result};

use shelf_core::{Bookmark, BookmarkPatch, Lookup, SyncSnapshot};

use crate::app::{explain, App};
use crate::output::Output;
use crate::prompt::confirm;

/// Add a bookmark
pub async fn add(app: &App, url: String, title: String, output: &Output) -> Result<()> {
    let (sync, _events) = app.open_view().await?;
    let result = sync.add(&url, &title).await;
    sync.teardown().await;

    let bookmark = result.map_err(explain)?;
    output.success(&format!("Added bookmark: {}", bookmark.id));
    output.print_bookmark(&bookmark);
    Ok(())
}

/// List bookmarks, newest first
pub async fn list(app: &App, output: &Output) -> Result<()> {
    let (sync, _events) = app.open_view().await?;
    let snapshot = sync.snapshot();
    sync.teardown().await;

    output.print_bookmarks(&snapshot.bookmarks);
    Ok(())
}

/// Change a bookmark's url or title
pub async fn edit(
    app: &App,
    id: String,
    url: Option<String>,
    title: Option<String>,
    output: &Output,
) -> Result<()> {
    let patch = BookmarkPatch { url, title };
    if patch.is_empty() {
        bail!("Nothing to change. Pass --url and/or --title.");
    }

    let (sync, _events) = app.open_view().await?;
    let snapshot = sync.snapshot();
    let id = match resolve(&snapshot, &id) {
        Ok(bookmark) => bookmark.id.clone(),
        Err(e) => {
            sync.teardown().await;
            return Err(e);
        }
    };

    let result = sync.update(id, patch).await;
    sync.teardown().await;

    let bookmark = result.map_err(explain)?;
    output.success(&format!("Updated bookmark: {}", bookmark.id));
    output.print_bookmark(&bookmark);
    Ok(())
}

/// Delete a bookmark
pub async fn delete(app: &App, id: String, yes: bool, output: &Output) -> Result<()> {
    let (sync, _events) = app.open_view().await?;
    let snapshot = sync.snapshot();
    let bookmark = match resolve(&snapshot, &id) {
        Ok(bookmark) => bookmark.clone(),
        Err(e) => {
            sync.teardown().await;
            return Err(e);
        }
    };

    if output.should_prompt() && !yes {
        println!("Delete bookmark: {} - {}", bookmark.short_id(), bookmark.title);
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            sync.teardown().await;
            return Ok(());
        }
    }

    let result = sync.delete(bookmark.id.clone()).await;
    sync.teardown().await;
    result.map_err(explain)?;

    output.success(&format!("Deleted bookmark: {}", bookmark.id));
    Ok(())
}

/// Open a bookmark in the default browser
pub async fn open(app: &App, id: String, output: &Output) -> Result<()> {
    let (sync, _events) = app.open_view().await?;
    let snapshot = sync.snapshot();
    sync.teardown().await;

    let bookmark = resolve(&snapshot, &id)?;
    open::that(&bookmark.url).with_context(|| format!("Failed to open {}", bookmark.url))?;
    output.success(&format!("Opened {}", bookmark.url));
    Ok(())
}

/// Find a bookmark by full id or unique prefix
fn resolve<'a>(snapshot: &'a SyncSnapshot, id: &str) -> Result<&'a Bookmark> {
    if id.trim().is_empty() {
        bail!("Bookmark ID cannot be empty");
    }

    match snapshot.lookup(id) {
        Lookup::Found(bookmark) => Ok(bookmark),
        Lookup::Missing => bail!("No bookmark found matching: {}", id),
        Lookup::Ambiguous(matches) => {
            eprintln!("Multiple bookmarks match '{}':", id);
            for bookmark in &matches {
                eprintln!("  {} - {}", bookmark.id, bookmark.title);
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}
