//! Demo pages rendered with Maud

use anyhow::{anyhow, Result};
use maud::{html, Markup, DOCTYPE};
use serde_json::json;
use silcrow_isr::config::LocaleConfig;
use silcrow_isr::{
    paths_fn, props_fn, render_fn, FallbackMode, PageModule, PageRegistry, PathEntry,
    RenderContext, Renderer, StaticPaths, StaticProps,
};
use silcrow_router::ParamValue;
use std::sync::Arc;

/// id, title, body
const POSTS: &[(&str, &str, &str)] = &[
    ("1", "Hello Silcrow", "Pages are prerendered and refreshed in the background."),
    ("2", "Tags", "Invalidate every page tagged `posts` with one webhook call."),
    ("3", "Fallbacks", "Posts added after the build render on their first request."),
];

fn find_post(id: &str) -> Option<(&'static str, &'static str, &'static str)> {
    POSTS.iter().copied().find(|(post_id, _, _)| *post_id == id)
}

pub fn registry(locales: LocaleConfig) -> Result<PageRegistry> {
    let posts = PageModule::new("/posts/[id]")?
        .with_source("pages/posts/[id].rs")
        .with_revalidate(300)
        .with_tags(["posts"])
        .with_paths(paths_fn(|_| async {
            let paths = POSTS
                .iter()
                .map(|(id, _, _)| PathEntry::Path(format!("/posts/{}", id)));
            Ok(StaticPaths::new(paths, FallbackMode::Blocking))
        }))
        .with_static_props(props_fn(|ctx| async move {
            let id = ctx
                .params
                .get("id")
                .and_then(ParamValue::as_single)
                .unwrap_or_default();

            Ok(match find_post(id) {
                Some((id, title, body)) => {
                    let mut props = StaticProps::props(json!({ "id": id, "title": title, "body": body }));
                    props.tags.push(format!("post:{}", id));
                    props
                }
                None => StaticProps::not_found(),
            })
        }));

    Ok(PageRegistry::new(locales)
        .with_page(PageModule::new("/")?.with_source("pages/index.rs").with_tags(["home"]))
        .with_page(PageModule::new("/time")?.with_source("pages/time.rs").with_revalidate(10))
        .with_page(posts))
}

fn layout(title: &str, content: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                title { (title) " | Silcrow" }
            }
            body {
                nav {
                    a href="/" { "Home" } " · "
                    a href="/time" { "Time" }
                }
                main { (content) }
            }
        }
    }
}

fn render_page(path: &str, ctx: &RenderContext) -> Option<Markup> {
    match path {
        "/" => Some(layout(
            "Home",
            html! {
                h1 { "Welcome to Silcrow" }
                ul {
                    @for (id, title, _) in POSTS {
                        li { a href={ "/posts/" (id) } { (title) } }
                    }
                }
            },
        )),
        "/time" => {
            let now = chrono::Utc::now().to_rfc3339();
            Some(layout(
                "Time",
                html! {
                    h1 { "Rendered at" }
                    time datetime=(now) { (now) }
                    div data-silcrow-boundary="clock" {}
                },
            ))
        }
        _ => {
            let props = ctx.props.as_ref()?;
            let title = props["title"].as_str().unwrap_or_default();
            Some(layout(
                title,
                html! {
                    article {
                        h1 { (title) }
                        p { (props["body"].as_str().unwrap_or_default()) }
                    }
                },
            ))
        }
    }
}

pub fn renderer() -> Arc<dyn Renderer> {
    render_fn(|path, ctx| async move {
        render_page(&path, &ctx)
            .map(Markup::into_string)
            .ok_or_else(|| anyhow!("no page renders {}", path))
    })
}
