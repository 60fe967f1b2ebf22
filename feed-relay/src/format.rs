//! Rendering of posts into channel messages.

use crate::types::{Button, DeliveryTask, LinkConfig, PostOrigin, PostRecord};
use interfaces::defs::ButtonRow;

/// Upper bound on rendered title plus rendered body, in characters.
pub const CAPTION_BUDGET: usize = 900;

const ELLIPSIS: &str = "...";

pub const UPVOTE_CALLBACK: &str = "upvote";
pub const DOWNVOTE_CALLBACK: &str = "downvote";

/// Escape the characters the channel's HTML markup reserves.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Bound an already escaped title/body pair so their combined length stays
/// within `budget`. The title is only cut when it alone exceeds the budget,
/// in which case the body is dropped.
pub fn truncate_post(title: &str, body: &str, budget: usize) -> (String, String) {
    let title_len = title.chars().count();
    let body_len = body.chars().count();

    if title_len + body_len <= budget {
        return (title.to_string(), body.to_string());
    }
    if title_len > budget {
        return (shorten(title, budget), String::new());
    }
    (title.to_string(), shorten(body, budget - title_len))
}

/// Cut to at most `limit` characters ending in an ellipsis. Never splits an
/// HTML entity; too little room for the ellipsis yields an empty string.
fn shorten(text: &str, limit: usize) -> String {
    if limit < ELLIPSIS.len() {
        return String::new();
    }
    let mut cut: String = text.chars().take(limit - ELLIPSIS.len()).collect();
    if let Some(amp) = cut.rfind('&') {
        if !cut[amp..].contains(';') {
            cut.truncate(amp);
        }
    }
    cut.push_str(ELLIPSIS);
    cut
}

pub fn render_caption(post: &PostRecord, links: &LinkConfig) -> String {
    let (title, body) = truncate_post(&escape_html(&post.title), &escape_html(&post.body), CAPTION_BUDGET);
    let feed = escape_html(&post.feed_address);

    let mut caption = String::new();
    if !title.is_empty() {
        caption.push_str(&format!("<b>{}</b>\n", title));
    }
    caption.push_str(&body);
    caption.push_str(&format!(
        "\n\nSubmitted on <a href=\"{}/#/p/{}\">p/{}</a> by {}",
        links.plebchan_base,
        feed,
        feed,
        escape_html(&post.author)
    ));
    caption
}

pub fn post_buttons(post: &PostRecord, links: &LinkConfig) -> Vec<ButtonRow> {
    vec![
        vec![
            Button::url(
                "View on Seedit",
                format!("{}/#/p/{}/c/{}", links.seedit_base, post.feed_address, post.id),
            ),
            Button::url(
                "View on Plebchan",
                format!("{}/#/p/{}/c/{}", links.plebchan_base, post.feed_address, post.id),
            ),
        ],
        vec![
            Button::callback("-1", DOWNVOTE_CALLBACK),
            Button::callback("+1", UPVOTE_CALLBACK),
        ],
    ]
}

pub fn build_task(chat_id: &str, post: &PostRecord, links: &LinkConfig) -> DeliveryTask {
    DeliveryTask {
        chat_id: chat_id.to_string(),
        text: render_caption(post, links),
        media: post.link.clone(),
        buttons: post_buttons(post, links),
        origin: Some(PostOrigin {
            post_id: post.id.clone(),
            feed_address: post.feed_address.clone(),
        }),
    }
}
