//! Semantic action codes.
//!
//! Every change record carries a numeric `SemanticAction`. Codes are grouped
//! into regions; most codes inside a region also have a specific meaning.

/// Entity deleted.
pub const DELETED_THIS_ITEM: i64 = 72;
/// Entity moved in the visual space.
pub const MOVED_IN_SPACE: i64 = 74;

/// Returns the region prefix of a code.
#[must_use]
pub const fn region(code: i64) -> Option<&'static str> {
    match code {
        1..=49 => Some("Internal operation was made"),
        50..=69 => Some("region Visual Clusters and Zoomable Space-"),
        70..=89 => Some("region Entity CRUD Operations-"),
        90..=149 => Some("region Project Operations-"),
        150..=169 => Some("region User Management-"),
        170..=199 => Some("region Linked Data Changes-"),
        200..=209 => Some("region Full-Text Search Indexing-"),
        210..=219 => Some("region List Management-"),
        220..=229 => Some("region Linking and Meta Linking-"),
        230..=239 => Some("region Keyphrases Extraction-"),
        240..=249 => Some("region Kinds-"),
        250..=259 => Some("region Same Entities-"),
        300..=499 => Some("region Entity Semantic Activities-"),
        _ => None,
    }
}

#[allow(clippy::too_many_lines)]
const fn specific(code: i64) -> &'static str {
    match code {
        50 => "Removed this item from visual cluster",
        51 => "Added this item to visual cluster",
        52 => "System removed this item from visual cluster",
        53 => "Created a visual cluster",
        54 => "Moved visual cluster in the space",
        55 => "Deleted a visual cluster",
        56 => "Unpinned from a project space",
        70 => "Created this item",
        71 => "Changed",
        72 => "Deleted this item",
        73 => "Renamed this item",
        74 => "Moved in the space",
        75 => "Changed a property",
        76 => "System assigned to an application account",
        77 => "Thumbnail extracted and saved",
        78 => "Description updated",
        90 => "New project was detected",
        91 => "Deleted a project space",
        92 => "Joined project space",
        93 => "Left project space",
        94 => "Moved an entity within the project space",
        95 => "Deleted an entity from the project space",
        96 => "Added new entity to the project space",
        97 => "System marked this project space as the last visited",
        150 => "Entered this project space",
        151 => "Left this project space",
        152 => "Moved within this project space",
        170 => "Linked file was renamed or moved",
        171 => "Linked file is no longer available",
        172 => "Started copying file to local cache or linked app folder",
        173 => "Finished copying file to local cache or linked app folder",
        174 => "Started uploading of file to linked app remote data source",
        175 => "Finished uploading of file to linked app remote data source",
        180 => "Started downloading web page",
        181 => "Finished downloading web page",
        182 => "Failed to download web page",
        185 => "Contents changed",
        200 => "System made this item ready for full-text search",
        201 => "System failed to make this item ready for full-text search",
        210 => "Added to a list",
        211 => "Added to a project space",
        218 => "Removed from a project space",
        219 => "Removed from a list",
        220 => "Linked to Meta entity",
        221 => "Linked to another entity",
        222 => "Entities extracted and linked",
        223 => "System fixed meta id and re-bound entity to its holding project",
        224 => "Link to another entity removed",
        230 => "Added a keyphrase",
        231 => "Deleted a keyphrase",
        232 => "All keyphrases removed",
        233 => "System updated keyphrases",
        234 => "System extracted keyphrases",
        235 => "System recalculated keyphrases",
        240 => "System identified item's kind",
        241 => "Changed item's kind",
        250 => "Same entity was found",
        251 => "Same person was found",
        300 => "Opened",
        301 => "Marked as read",
        302 => "Marked as unread",
        303 => "Edited",
        304 => "System marked it as unread",
        310 => "Cleared color status",
        311 => "Marked as \"in progress\"",
        312 => "Marked as \"action required\"",
        313 => "Marked as \"done\"",
        314 => "Flagged as important",
        315 => "Flagged as not important",
        316 => "Resized",
        317 => "Changed privacy status",
        318 => "Flagged as top",
        319 => "Flagged as normal",
        _ => "",
    }
}

/// Returns the human-readable description of a code.
///
/// Codes outside every region have no description.
#[must_use]
pub fn describe(code: i64) -> Option<String> {
    region(code).map(|prefix| format!("{prefix}{}", specific(code)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(7, "Internal operation was made" ; "internal")]
    #[test_case(70, "region Entity CRUD Operations-Created this item" ; "created")]
    #[test_case(88, "region Entity CRUD Operations-" ; "region only")]
    #[test_case(313, "region Entity Semantic Activities-Marked as \"done\"" ; "activity")]
    fn test_describe(code: i64, expected: &str) {
        assert_eq!(describe(code).as_deref(), Some(expected));
    }

    #[test_case(0)]
    #[test_case(260)]
    #[test_case(500)]
    fn test_unknown_codes(code: i64) {
        assert_eq!(describe(code), None);
    }
}
