use axum::extract::State;
use axum::response::Html;
use minijinja::{context, Environment};

use crate::app::{AppState, AppStateData};
use crate::error::{Error, ErrorDetails};

/// Build the template environment with all page templates embedded.
pub fn build_template_environment() -> Result<Environment<'static>, Error> {
    let mut environment = Environment::new();
    let templates = [
        ("base.html", include_str!("../../templates/base.html")),
        ("landing.html", include_str!("../../templates/landing.html")),
        ("chat.html", include_str!("../../templates/chat.html")),
    ];
    for (name, source) in templates {
        environment.add_template(name, source).map_err(|e| {
            Error::new(ErrorDetails::Template {
                template_name: name.to_string(),
                message: e.to_string(),
            })
        })?;
    }
    Ok(environment)
}

fn render(
    app_state: &AppStateData,
    template_name: &str,
    ctx: minijinja::Value,
) -> Result<Html<String>, Error> {
    let template = app_state.templates.get_template(template_name).map_err(|e| {
        Error::new(ErrorDetails::Template {
            template_name: template_name.to_string(),
            message: e.to_string(),
        })
    })?;
    let body = template.render(ctx).map_err(|e| {
        Error::new(ErrorDetails::Template {
            template_name: template_name.to_string(),
            message: e.to_string(),
        })
    })?;
    Ok(Html(body))
}

/// `GET /`
pub async fn landing_page(State(app_state): AppState) -> Result<Html<String>, Error> {
    render(&app_state, "landing.html", context! {})
}

/// `GET /conversation`
pub async fn conversation_page(State(app_state): AppState) -> Result<Html<String>, Error> {
    render(
        &app_state,
        "chat.html",
        context! {
            capability => "conversation",
            title => "Conversation",
            description => "A smart conversation.",
            placeholder => "What is the radius of the sun?",
            empty_label => "No conversation started, let's talk!",
            markdown => false,
        },
    )
}

/// `GET /code`
pub async fn code_page(State(app_state): AppState) -> Result<Html<String>, Error> {
    render(
        &app_state,
        "chat.html",
        context! {
            capability => "code",
            title => "Code Generation",
            description => "Generate code from a prompt.",
            placeholder => "Write a binary search in Rust.",
            empty_label => "No code generated yet.",
            markdown => true,
        },
    )
}
