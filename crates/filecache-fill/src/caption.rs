use crate::types::CatalogItem;

/// Caption limit of the blob store, in bytes
pub const CAPTION_LIMIT: usize = 1024;

/// Build the upload caption: a title line, a blank line, then one line per
/// author. Authors are added in order while the caption stays within `limit`
/// bytes; the first author that does not fit ends the list.
pub fn build_caption(item: &CatalogItem, limit: usize) -> String {
    let mut caption = format!("📖 {}", item.title);
    if caption.len() > limit {
        let mut end = limit;
        while !caption.is_char_boundary(end) {
            end -= 1;
        }
        caption.truncate(end);
        return caption;
    }

    let mut separator = "\n\n";
    for author in &item.authors {
        let line = format!("👤 {}", author.display_name());
        if caption.len() + separator.len() + line.len() > limit {
            break;
        }
        caption.push_str(separator);
        caption.push_str(&line);
        separator = "\n";
    }
    caption
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CatalogAuthor;

    fn item(title: &str, authors: usize) -> CatalogItem {
        CatalogItem {
            id: 1,
            source_id: 1,
            remote_id: 1,
            title: title.to_string(),
            authors: (0..authors)
                .map(|i| CatalogAuthor {
                    first_name: format!("Имя{}", i),
                    last_name: format!("Фамилия{}", i),
                    middle_name: "Отчество".to_string(),
                })
                .collect(),
            available_types: vec!["fb2".into()],
        }
    }

    #[test]
    fn test_caption_format() {
        let caption = build_caption(&item("Солярис", 2), CAPTION_LIMIT);
        assert_eq!(
            caption,
            "📖 Солярис\n\n👤 Фамилия0 Имя0 Отчество\n👤 Фамилия1 Имя1 Отчество"
        );
    }

    #[test]
    fn test_caption_without_authors() {
        assert_eq!(build_caption(&item("Title", 0), CAPTION_LIMIT), "📖 Title");
    }

    #[test]
    fn test_caption_many_authors_is_prefix() {
        let item = item("Сборник рассказов", 50);
        let caption = build_caption(&item, CAPTION_LIMIT);
        assert!(caption.len() <= CAPTION_LIMIT);

        let (title, authors) = caption.split_once("\n\n").unwrap();
        assert_eq!(title, "📖 Сборник рассказов");

        let lines: Vec<&str> = authors.split('\n').collect();
        assert!(!lines.is_empty());
        assert!(lines.len() < 50);
        for (line, author) in lines.iter().zip(&item.authors) {
            assert_eq!(*line, format!("👤 {}", author.display_name()));
        }
    }

    #[test]
    fn test_caption_long_title_truncated_on_char_boundary() {
        let title = "я".repeat(600);
        let caption = build_caption(&item(&title, 3), CAPTION_LIMIT);
        assert!(caption.len() <= CAPTION_LIMIT);
        assert!(!caption.contains('👤'));
        assert!(caption.starts_with("📖 я"));
    }
}
