//! Streaming RSS 2.0 reader that understands the iTunes podcast namespace.
//!
//! Picks up the podcast fields a generic feed model drops (explicit flags,
//! season/episode numbers, episode type, nested categories, `media:content`)
//! while holding only the retained items in memory.
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;

use super::parser::{
    clean, push_category, Enclosure, ItemWindow, ParseError, ParsedChannel, ParsedFeed,
    ParsedItem,
};

/// Channel values as they are encountered; precedence is applied in
/// [`ChannelBuilder::finish`].
#[derive(Default)]
struct ChannelBuilder {
    title: Option<String>,
    description: Option<String>,
    summary: Option<String>,
    itunes_author: Option<String>,
    editor: Option<String>,
    itunes_image: Option<String>,
    image_url: Option<String>,
    language: Option<String>,
    explicit: Option<String>,
    categories: Vec<String>,
}

impl ChannelBuilder {
    fn finish(self) -> ParsedChannel {
        ParsedChannel {
            title: self.title.unwrap_or_default(),
            description: self.description.or(self.summary),
            author: self.itunes_author.or(self.editor),
            image_url: self.itunes_image.or(self.image_url),
            language: self.language,
            explicit: self.explicit,
            categories: self.categories,
        }
    }
}

#[derive(Default)]
struct ItemBuilder {
    guid: Option<String>,
    title: Option<String>,
    itunes_title: Option<String>,
    description: Option<String>,
    encoded: Option<String>,
    summary: Option<String>,
    pub_date: Option<String>,
    dc_date: Option<String>,
    enclosures: Vec<Enclosure>,
    media: Vec<Enclosure>,
    duration: Option<String>,
    season: Option<String>,
    episode: Option<String>,
    episode_type: Option<String>,
    explicit: Option<String>,
    image_url: Option<String>,
}

impl ItemBuilder {
    fn finish(self) -> ParsedItem {
        // `<enclosure>` first; `media:content` only adds URLs not seen there.
        let mut enclosures = self.enclosures;
        for media in self.media {
            if enclosures.iter().all(|e| e.url != media.url) {
                enclosures.push(media);
            }
        }

        ParsedItem {
            guid: self.guid,
            title: self.title.or(self.itunes_title),
            description: self.description.or(self.encoded).or(self.summary),
            published: self.pub_date.or(self.dc_date),
            enclosures,
            duration: self.duration,
            season: self.season,
            episode: self.episode,
            episode_type: self.episode_type,
            explicit: self.explicit,
            image_url: self.image_url,
        }
    }
}

/// Keeps the first value seen for a field.
fn set_once(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Elements whose children are fields. Markup below a field belongs to the
/// field's text.
fn holds_fields(name: &[u8]) -> bool {
    matches!(name, b"rss" | b"channel" | b"item" | b"image")
}

/// True when the document's root element is `<rss>` (RSS 0.9x and 2.0).
///
/// Stops at the first element, so the cost does not grow with the feed.
pub(super) fn is_rss_document(bytes: &[u8]) -> bool {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return e.local_name().as_ref() == b"rss";
            }
            Ok(Event::Eof) | Err(_) => return false,
            _ => {}
        }
        buf.clear();
    }
}

pub(super) fn read_rss(bytes: &[u8], item_limit: usize) -> Result<ParsedFeed, ParseError> {
    // quick-xml (0.37) never expands <!ENTITY> declarations; only the five
    // XML builtins are resolved when unescaping. Text is decoded with the
    // encoding named in the XML declaration.
    let mut reader = Reader::from_reader(bytes);

    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();
    let mut channel = ChannelBuilder::default();
    let mut item: Option<ItemBuilder> = None;
    let mut window = ItemWindow::new(item_limit);

    loop {
        let in_field = stack.last().is_some_and(|top| !holds_fields(top));
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                if in_field {
                    text.push('<');
                    text.push_str(&decode_raw(&reader, &e));
                    text.push('>');
                } else {
                    if name == b"item" {
                        item = Some(ItemBuilder::default());
                    }
                    text.clear();
                }
                read_attributes(&e, &name, &stack, &reader, &mut channel, item.as_mut());
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = e.name().as_ref().to_vec();
                if in_field {
                    text.push('<');
                    text.push_str(&decode_raw(&reader, &e));
                    text.push_str("/>");
                }
                read_attributes(&e, &name, &stack, &reader, &mut channel, item.as_mut());
            }
            Ok(Event::Text(e)) => text.push_str(&decode_text(&reader, &e)),
            Ok(Event::CData(e)) => text.push_str(&decode_raw(&reader, &e)),
            Ok(Event::End(_)) => {
                if let Some(name) = stack.pop() {
                    let parent = stack.last().map(Vec::as_slice);

                    if parent.is_some_and(|p| !holds_fields(p)) {
                        text.push_str("</");
                        text.push_str(&decode_raw(&reader, &name));
                        text.push('>');
                    } else {
                        let value = clean(&text);
                        text.clear();

                        if name == b"item" {
                            if let Some(done) = item.take() {
                                window.push(done.finish());
                            }
                        } else if parent == Some(b"item".as_slice()) {
                            if let Some(current) = item.as_mut() {
                                assign_item_field(current, &name, value);
                            }
                        } else if parent == Some(b"channel".as_slice()) {
                            assign_channel_field(&mut channel, &name, value);
                        } else if parent == Some(b"image".as_slice())
                            && name == b"url"
                            && is_channel_child(&stack)
                        {
                            set_once(&mut channel.image_url, value);
                        }
                    }
                }
            }
            Ok(Event::Eof) => {
                if let Some(open) = stack.last() {
                    return Err(ParseError::Malformed(format!(
                        "Unexpected end of document inside <{}>",
                        String::from_utf8_lossy(open)
                    )));
                }
                break;
            }
            Err(e) => {
                return Err(ParseError::Malformed(format!(
                    "XML error at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    let (items, items_seen) = window.finish();
    Ok(ParsedFeed {
        channel: channel.finish(),
        items,
        items_seen,
    })
}

/// True when the innermost open element is a direct child of `<channel>`.
fn is_channel_child(stack: &[Vec<u8>]) -> bool {
    stack.len() >= 2 && stack[stack.len() - 2] == b"channel"
}

fn decode_text(reader: &Reader<&[u8]>, e: &BytesText<'_>) -> String {
    match e.unescape() {
        Ok(text) => text.into_owned(),
        // HTML entities such as &nbsp; are common in feeds; keep them verbatim.
        Err(_) => decode_raw(reader, e),
    }
}

/// Decodes bytes with the document's encoding, without unescaping.
fn decode_raw(reader: &Reader<&[u8]>, bytes: &[u8]) -> String {
    match reader.decoder().decode(bytes) {
        Ok(text) => text.into_owned(),
        Err(err) => {
            tracing::debug!(error = %err, "Undecodable feed text; replacing invalid bytes");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn attribute(e: &BytesStart<'_>, reader: &Reader<&[u8]>, key: &[u8]) -> Option<String> {
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::debug!(error = %err, "Skipping malformed feed attribute");
                continue;
            }
        };
        if attr.key.as_ref() == key {
            return attr
                .decode_and_unescape_value(reader.decoder())
                .ok()
                .and_then(clean);
        }
    }
    None
}

/// Handles the elements whose payload lives in attributes rather than text.
fn read_attributes(
    e: &BytesStart<'_>,
    name: &[u8],
    stack: &[Vec<u8>],
    reader: &Reader<&[u8]>,
    channel: &mut ChannelBuilder,
    item: Option<&mut ItemBuilder>,
) {
    let parent = stack.last().map(Vec::as_slice);
    let in_item = stack.iter().any(|n| n == b"item");

    match name {
        b"enclosure" if parent == Some(b"item".as_slice()) => {
            if let (Some(item), Some(url)) = (item, attribute(e, reader, b"url")) {
                item.enclosures.push(Enclosure {
                    url,
                    mime_type: attribute(e, reader, b"type"),
                    length: attribute(e, reader, b"length").and_then(|l| l.parse().ok()),
                });
            }
        }
        // Directly under <item> or wrapped in <media:group>.
        b"media:content" if in_item => {
            if let (Some(item), Some(url)) = (item, attribute(e, reader, b"url")) {
                item.media.push(Enclosure {
                    url,
                    mime_type: attribute(e, reader, b"type"),
                    length: attribute(e, reader, b"fileSize").and_then(|l| l.parse().ok()),
                });
            }
        }
        b"itunes:image" if parent == Some(b"item".as_slice()) => {
            if let Some(item) = item {
                set_once(&mut item.image_url, attribute(e, reader, b"href"));
            }
        }
        b"itunes:image" if parent == Some(b"channel".as_slice()) => {
            set_once(&mut channel.itunes_image, attribute(e, reader, b"href"));
        }
        // Nested taxonomy: every level contributes a flat term.
        b"itunes:category" if !in_item => {
            if let Some(term) = attribute(e, reader, b"text") {
                push_category(&mut channel.categories, &term);
            }
        }
        _ => {}
    }
}

fn assign_channel_field(channel: &mut ChannelBuilder, name: &[u8], value: Option<String>) {
    match name {
        b"title" => set_once(&mut channel.title, value),
        b"description" => set_once(&mut channel.description, value),
        b"itunes:summary" => set_once(&mut channel.summary, value),
        b"itunes:author" => set_once(&mut channel.itunes_author, value),
        b"managingEditor" => set_once(&mut channel.editor, value),
        b"language" => set_once(&mut channel.language, value),
        b"itunes:explicit" => set_once(&mut channel.explicit, value),
        b"category" => {
            if let Some(term) = value {
                push_category(&mut channel.categories, &term);
            }
        }
        _ => {}
    }
}

fn assign_item_field(item: &mut ItemBuilder, name: &[u8], value: Option<String>) {
    match name {
        b"guid" => set_once(&mut item.guid, value),
        b"title" => set_once(&mut item.title, value),
        b"itunes:title" => set_once(&mut item.itunes_title, value),
        b"description" => set_once(&mut item.description, value),
        b"content:encoded" => set_once(&mut item.encoded, value),
        b"itunes:summary" => set_once(&mut item.summary, value),
        b"pubDate" => set_once(&mut item.pub_date, value),
        b"dc:date" => set_once(&mut item.dc_date, value),
        b"itunes:duration" => set_once(&mut item.duration, value),
        b"itunes:season" => set_once(&mut item.season, value),
        b"itunes:episode" => set_once(&mut item.episode, value),
        b"itunes:episodeType" => set_once(&mut item.episode_type, value),
        b"itunes:explicit" => set_once(&mut item.explicit, value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::parse_feed;
    use pretty_assertions::assert_eq;

    const PODCAST_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"
     xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd"
     xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Show A</title>
    <description>All about &lt;things&gt; &amp; stuff</description>
    <language>fr</language>
    <managingEditor>editor@example.com (Ed)</managingEditor>
    <itunes:author>Alice Host</itunes:author>
    <itunes:explicit>yes</itunes:explicit>
    <itunes:image href="https://example.com/cover.jpg"/>
    <image>
      <url>https://example.com/fallback.jpg</url>
      <title>Show A</title>
    </image>
    <category>Culture</category>
    <itunes:category text="Technology">
      <itunes:category text="Podcasting"/>
    </itunes:category>
    <itunes:category text="Culture"/>
    <itunes:owner><itunes:name>Owner Name</itunes:name></itunes:owner>
    <item>
      <guid isPermaLink="false">ep-2</guid>
      <title>Second Episode</title>
      <description><![CDATA[<p>Second &amp; better</p>]]></description>
      <pubDate>Wed, 03 Jan 2024 10:00:00 +0000</pubDate>
      <enclosure url="https://cdn.example.com/ep2.mp3" type="audio/mpeg" length="12345"/>
      <itunes:duration>1:02:03</itunes:duration>
      <itunes:season>2</itunes:season>
      <itunes:episode>7</itunes:episode>
      <itunes:episodeType>bonus</itunes:episodeType>
      <itunes:explicit>no</itunes:explicit>
      <itunes:image href="https://example.com/ep2.jpg"/>
    </item>
    <item>
      <title>First Episode</title>
      <content:encoded>Encoded body</content:encoded>
      <pubDate>not a date</pubDate>
      <enclosure url="https://cdn.example.com/ep1.mp3" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_channel_fields() {
        let parsed = parse_feed(PODCAST_RSS.as_bytes(), 10).unwrap();
        let channel = &parsed.channel;
        assert_eq!(channel.title, "Show A");
        assert_eq!(
            channel.description.as_deref(),
            Some("All about <things> & stuff")
        );
        assert_eq!(channel.language.as_deref(), Some("fr"));
        assert_eq!(channel.author.as_deref(), Some("Alice Host"));
        assert_eq!(channel.explicit.as_deref(), Some("yes"));
        assert_eq!(
            channel.image_url.as_deref(),
            Some("https://example.com/cover.jpg")
        );
    }

    #[test]
    fn test_categories_flattened_and_deduplicated() {
        let parsed = parse_feed(PODCAST_RSS.as_bytes(), 10).unwrap();
        assert_eq!(
            parsed.channel.categories,
            vec![
                "Culture".to_string(),
                "Technology".to_string(),
                "Podcasting".to_string()
            ]
        );
    }

    #[test]
    fn test_item_fields() {
        let parsed = parse_feed(PODCAST_RSS.as_bytes(), 10).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items_seen, 2);

        let item = &parsed.items[0];
        assert_eq!(item.guid.as_deref(), Some("ep-2"));
        assert_eq!(item.title.as_deref(), Some("Second Episode"));
        assert_eq!(item.description.as_deref(), Some("<p>Second &amp; better</p>"));
        assert_eq!(
            item.published.as_deref(),
            Some("Wed, 03 Jan 2024 10:00:00 +0000")
        );
        assert_eq!(
            item.enclosures,
            vec![Enclosure {
                url: "https://cdn.example.com/ep2.mp3".into(),
                mime_type: Some("audio/mpeg".into()),
                length: Some(12345),
            }]
        );
        assert_eq!(item.duration.as_deref(), Some("1:02:03"));
        assert_eq!(item.season.as_deref(), Some("2"));
        assert_eq!(item.episode.as_deref(), Some("7"));
        assert_eq!(item.episode_type.as_deref(), Some("bonus"));
        assert_eq!(item.explicit.as_deref(), Some("no"));
        assert_eq!(item.image_url.as_deref(), Some("https://example.com/ep2.jpg"));
    }

    #[test]
    fn test_item_fallbacks() {
        let parsed = parse_feed(PODCAST_RSS.as_bytes(), 10).unwrap();
        let item = &parsed.items[1];
        assert_eq!(item.guid, None);
        assert_eq!(item.description.as_deref(), Some("Encoded body"));
        // Raw value kept; interpretation is the normalizer's job.
        assert_eq!(item.published.as_deref(), Some("not a date"));
        assert_eq!(item.image_url, None);
    }

    #[test]
    fn test_item_limit_bounds_retained_items() {
        let parsed = parse_feed(PODCAST_RSS.as_bytes(), 1).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items_seen, 2);
        assert_eq!(parsed.items[0].title.as_deref(), Some("Second Episode"));
    }

    #[test]
    fn test_channel_image_fallback_and_editor_author() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Plain</title>
  <managingEditor>editor@example.com</managingEditor>
  <image><url>https://example.com/plain.png</url></image>
</channel></rss>"#;
        let parsed = parse_feed(rss.as_bytes(), 10).unwrap();
        assert_eq!(
            parsed.channel.image_url.as_deref(),
            Some("https://example.com/plain.png")
        );
        assert_eq!(parsed.channel.author.as_deref(), Some("editor@example.com"));
        assert_eq!(parsed.channel.language, None);
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn test_item_title_not_taken_as_channel_title() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <item><title>Item Title</title></item>
  <title>Channel Title</title>
</channel></rss>"#;
        let parsed = parse_feed(rss.as_bytes(), 10).unwrap();
        assert_eq!(parsed.channel.title, "Channel Title");
    }

    #[test]
    fn test_inline_markup_kept_in_description() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Markup</title>
  <description>Hello <b>big</b> world<br/>again</description>
  <item>
    <title>Ep</title>
    <description>Intro <a href="https://example.com/?a=1&amp;b=2">link</a> outro</description>
  </item>
</channel></rss>"#;
        let parsed = parse_feed(rss.as_bytes(), 10).unwrap();
        assert_eq!(
            parsed.channel.description.as_deref(),
            Some("Hello <b>big</b> world<br/>again")
        );
        assert_eq!(
            parsed.items[0].description.as_deref(),
            Some(r#"Intro <a href="https://example.com/?a=1&amp;b=2">link</a> outro"#)
        );
        assert_eq!(parsed.items[0].title.as_deref(), Some("Ep"));
    }

    #[test]
    fn test_latin1_feed_decoded_from_declaration() {
        let mut rss = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n<rss version=\"2.0\"><channel><title>Caf".to_vec();
        rss.push(0xE9);
        rss.extend_from_slice(b"</title><item><title>");
        rss.extend_from_slice(b"<![CDATA[Cr");
        rss.push(0xE8);
        rss.extend_from_slice(b"me]]></title></item></channel></rss>");

        let parsed = parse_feed(&rss, 10).unwrap();
        assert_eq!(parsed.channel.title, "Caf\u{e9}");
        assert_eq!(parsed.items[0].title.as_deref(), Some("Cr\u{e8}me"));
    }

    #[test]
    fn test_media_content_supplies_enclosures() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/"><channel>
  <title>Media</title>
  <item>
    <title>Media only</title>
    <media:content url="https://cdn.example.com/m.mp3" type="audio/mpeg" fileSize="2048"/>
  </item>
  <item>
    <title>Both</title>
    <enclosure url="https://cdn.example.com/b.mp3" type="audio/mpeg"/>
    <media:group>
      <media:content url="https://cdn.example.com/b.mp3" type="audio/mpeg"/>
      <media:content url="https://cdn.example.com/b.m4a" type="audio/mp4"/>
    </media:group>
  </item>
</channel></rss>"#;
        let parsed = parse_feed(rss.as_bytes(), 10).unwrap();
        assert_eq!(
            parsed.items[0].enclosures,
            vec![Enclosure {
                url: "https://cdn.example.com/m.mp3".into(),
                mime_type: Some("audio/mpeg".into()),
                length: Some(2048),
            }]
        );
        let urls: Vec<_> = parsed.items[1]
            .enclosures
            .iter()
            .map(|e| e.url.as_str())
            .collect();
        assert_eq!(
            urls,
            vec!["https://cdn.example.com/b.mp3", "https://cdn.example.com/b.m4a"]
        );
    }

    #[test]
    fn test_root_element_detection() {
        assert!(is_rss_document(PODCAST_RSS.as_bytes()));
        assert!(is_rss_document(b"<!-- generated --><rss version=\"0.92\"/>"));
        assert!(!is_rss_document(
            b"<feed xmlns=\"http://www.w3.org/2005/Atom\"><title>A</title></feed>"
        ));
        assert!(!is_rss_document(b"<html><body>Hello</body></html>"));
        assert!(!is_rss_document(br#"{"version": "https://jsonfeed.org/version/1.1"}"#));
        assert!(!is_rss_document(b""));
    }
}
