//! Sign-in command handlers

use anyhow::{bail, Context, Result};

use shelf_core::{BackendKind, IdentityProvider, Session, User};

use crate::app::App;
use crate::output::Output;

/// Store a session for a user id or an access token
pub async fn login(
    app: &App,
    user: Option<String>,
    token: Option<String>,
    email: Option<String>,
    output: &Output,
) -> Result<()> {
    let mut session = match (user, token) {
        (_, Some(token)) => {
            Session::from_access_token(token.trim()).context("Invalid access token")?
        }
        (Some(user), None) => {
            if app.config.backend == BackendKind::Hosted {
                output.warn("The hosted backend needs --token; a bare user id only works offline.");
            }
            Session::for_user(User::new(user.trim()))
        }
        (None, None) => bail!("Provide --user <id> or --token <access token>"),
    };

    if let Some(email) = email {
        session.user.email = Some(email);
    }

    let user = app.identity.sign_in(session).await?;

    if output.is_json() {
        output.print_user(&user);
    } else {
        output.success(&format!("Signed in as {}", display_name(&user)));
    }
    Ok(())
}

pub async fn logout(app: &App, output: &Output) -> Result<()> {
    app.identity.sign_out().await?;
    output.success("Signed out");
    Ok(())
}

/// Show the signed-in user
pub async fn whoami(app: &App, output: &Output) -> Result<()> {
    let user = app.require_user().await?;
    output.print_user(&user);
    Ok(())
}

fn display_name(user: &User) -> String {
    match user.email {
        Some(ref email) => email.clone(),
        None => user.id.to_string(),
    }
}
