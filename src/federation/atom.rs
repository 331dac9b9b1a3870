//! Outbound Atom rendering for legacy peers
//!
//! Only what Salmon slaps and WebSub pushes need: one entry per activity,
//! optionally wrapped in a single-entry feed.

use chrono::Utc;
use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::data::ASObject;

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
const ACTIVITY_NS: &str = "http://activitystrea.ms/spec/1.0/";
const THREAD_NS: &str = "http://purl.org/syndication/thread/1.0";

fn verb(activity_type: &str) -> &'static str {
    match activity_type {
        "Create" => "post",
        "Like" => "favorite",
        "Announce" => "share",
        "Follow" => "follow",
        "Delete" => "delete",
        "Update" => "update",
        "Undo" => "undo",
        "Block" => "block",
        "Accept" => "accept",
        "Reject" => "reject",
        _ => "post",
    }
}

fn text(value: Option<&str>) -> String {
    encode_text(value.unwrap_or_default()).into_owned()
}

/// The object of an activity, embedded or referenced.
fn object_of(activity: &ASObject) -> Option<ASObject> {
    match activity.first("object")? {
        serde_json::Value::String(id) => {
            let mut object = ASObject::new();
            object.set_id(id);
            Some(object)
        }
        value => ASObject::from_value(value.clone()),
    }
}

/// Render one `<entry>`; `with_namespaces` for a standalone document.
pub fn render_entry(activity: &ASObject, with_namespaces: bool) -> String {
    let activity_type = activity.first_type().unwrap_or("Activity");
    let object = object_of(activity);
    let now = Utc::now().to_rfc3339();
    let published = activity.first_str("published").map(str::to_string).unwrap_or(now);
    let actor = activity.first_id("actor");

    let mut xml = String::new();
    if with_namespaces {
        xml.push_str(&format!(
            "<entry xmlns=\"{}\" xmlns:activity=\"{}\" xmlns:thr=\"{}\">",
            ATOM_NS, ACTIVITY_NS, THREAD_NS
        ));
    } else {
        xml.push_str("<entry>");
    }

    xml.push_str(&format!("<id>{}</id>", text(activity.id())));
    xml.push_str(&format!("<title>{}</title>", encode_text(activity_type)));
    xml.push_str(&format!("<published>{}</published>", encode_text(&published)));
    xml.push_str(&format!("<updated>{}</updated>", encode_text(&published)));
    if let Some(actor) = &actor {
        xml.push_str(&format!("<author><uri>{}</uri></author>", encode_text(actor)));
    }
    xml.push_str(&format!(
        "<activity:verb>http://activitystrea.ms/schema/1.0/{}</activity:verb>",
        verb(activity_type)
    ));

    if let Some(object) = &object {
        let object_type = object.first_type().unwrap_or("note").to_ascii_lowercase();
        xml.push_str("<activity:object>");
        xml.push_str(&format!("<id>{}</id>", text(object.id())));
        xml.push_str(&format!(
            "<activity:object-type>http://activitystrea.ms/schema/1.0/{}</activity:object-type>",
            encode_text(&object_type)
        ));
        xml.push_str("</activity:object>");

        if let Some(parent) = object.first_id("inReplyTo") {
            xml.push_str(&format!(
                "<thr:in-reply-to ref=\"{}\"/>",
                encode_double_quoted_attribute(&parent)
            ));
        }
        if let Some(content) = object.first_str("content") {
            xml.push_str(&format!("<content type=\"html\">{}</content>", encode_text(content)));
        }
    }

    xml.push_str("</entry>");
    xml
}

/// A feed at `topic` holding one entry.
pub fn render_feed(topic: &str, author: &str, activity: &ASObject) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <feed xmlns=\"{ns}\" xmlns:activity=\"{act}\" xmlns:thr=\"{thr}\">\
         <id>{topic}</id><title>{author}</title><updated>{updated}</updated>\
         <link rel=\"self\" type=\"application/atom+xml\" href=\"{href}\"/>\
         <author><uri>{author}</uri></author>{entry}</feed>",
        ns = ATOM_NS,
        act = ACTIVITY_NS,
        thr = THREAD_NS,
        topic = encode_text(topic),
        author = encode_text(author),
        updated = Utc::now().to_rfc3339(),
        href = encode_double_quoted_attribute(topic),
        entry = render_entry(activity, false),
    )
}
