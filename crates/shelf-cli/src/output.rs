//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use shelf_core::{Bookmark, ChangeEvent, User};

/// Shown by `list` and `watch` when there is nothing to print
pub const EMPTY_LIST: &str = "No bookmarks yet. Add one with: shelf add <url> --title <title>";

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a single bookmark
    pub fn print_bookmark(&self, bookmark: &Bookmark) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:      {}", bookmark.id);
                println!("Title:   {}", bookmark.title);
                println!("URL:     {}", bookmark.url);
                println!(
                    "Created: {}",
                    bookmark.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            OutputFormat::Json => print_json(bookmark),
            OutputFormat::Quiet => println!("{}", bookmark.id),
        }
    }

    /// Print a list of bookmarks, newest first
    pub fn print_bookmarks(&self, bookmarks: &[Bookmark]) {
        match self.format {
            OutputFormat::Human => {
                if bookmarks.is_empty() {
                    println!("{}", EMPTY_LIST);
                    return;
                }
                for bookmark in bookmarks {
                    println!("{}", bookmark_line(bookmark));
                }
                println!("\n{} bookmark(s)", bookmarks.len());
            }
            OutputFormat::Json => print_json(bookmarks),
            OutputFormat::Quiet => {
                for bookmark in bookmarks {
                    println!("{}", bookmark.id);
                }
            }
        }
    }

    /// Print one live change
    pub fn print_change(&self, change: &ChangeEvent) {
        match self.format {
            OutputFormat::Human => match change {
                ChangeEvent::Insert(b) => println!("+ {}", bookmark_line(b)),
                ChangeEvent::Update(b) => println!("~ {}", bookmark_line(b)),
                ChangeEvent::Delete(d) => println!("- {}", d.id),
            },
            OutputFormat::Json => {
                let record = match change {
                    ChangeEvent::Insert(b) | ChangeEvent::Update(b) => serde_json::json!(b),
                    ChangeEvent::Delete(d) => serde_json::json!({ "id": d.id }),
                };
                println!(
                    "{}",
                    serde_json::json!({ "type": change.kind().to_string(), "record": record })
                );
            }
            OutputFormat::Quiet => println!("{} {}", change.kind(), change.id()),
        }
    }

    /// Print the signed-in user
    pub fn print_user(&self, user: &User) {
        match self.format {
            OutputFormat::Human => match user.email {
                Some(ref email) => println!("{} ({})", email, user.id),
                None => println!("{}", user.id),
            },
            OutputFormat::Json => print_json(user),
            OutputFormat::Quiet => println!("{}", user.id),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, msg: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", msg);
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode JSON output: {}", e),
    }
}

fn bookmark_line(bookmark: &Bookmark) -> String {
    format!(
        "{} | {} | {} | {}",
        bookmark.short_id(),
        truncate(&bookmark.title, 35),
        truncate(&bookmark.url, 45),
        bookmark.created_at.format("%Y-%m-%d")
    )
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
