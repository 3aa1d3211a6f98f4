use shared_types::{
    DuplicateCheckResult, DuplicateCheckStats, DuplicateMatch, ExistingContact, MatchType,
    NormalizedContact, RecommendedAction,
};
use std::collections::HashMap;
use std::time::Instant;

pub const EMAIL_MATCH_CONFIDENCE: f32 = 1.0;
pub const PHONE_MATCH_CONFIDENCE: f32 = 0.9;
pub const NAME_MATCH_CONFIDENCE: f32 = 0.8;

/// In-memory lookup over one organization's contacts.
///
/// Built once per job from a single prefetch so row-level matching never
/// touches the database. Only contacts of `organization_id` are ever indexed.
#[derive(Debug, Clone)]
pub struct ContactIndex {
    organization_id: i64,
    contacts: Vec<ExistingContact>,
    by_email: HashMap<String, Vec<usize>>,
    by_phone: HashMap<String, Vec<usize>>,
    by_name: HashMap<String, Vec<usize>>,
}

impl ContactIndex {
    pub fn build(organization_id: i64, contacts: Vec<ExistingContact>) -> Self {
        let total = contacts.len();
        let contacts: Vec<ExistingContact> = contacts
            .into_iter()
            .filter(|c| c.organization_id == organization_id)
            .collect();

        if contacts.len() != total {
            tracing::warn!(
                "Dropped {} contact(s) outside organization {} from the duplicate index",
                total - contacts.len(),
                organization_id
            );
        }

        let mut by_email: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_phone: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();

        for (position, contact) in contacts.iter().enumerate() {
            if let Some(email) = non_empty(&contact.normalized_email) {
                by_email.entry(email.to_string()).or_default().push(position);
            }
            if let Some(phone) = non_empty(&contact.normalized_phone) {
                by_phone.entry(phone.to_string()).or_default().push(position);
            }
            if let Some(name) = non_empty(&contact.normalized_name) {
                by_name.entry(name.to_string()).or_default().push(position);
            }
        }

        Self {
            organization_id,
            contacts,
            by_email,
            by_phone,
            by_name,
        }
    }

    pub fn organization_id(&self) -> i64 {
        self.organization_id
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Existing contacts that look like `contact`, best match first.
    ///
    /// Each existing contact appears at most once, with its highest tier.
    pub fn find_duplicates(&self, contact: &NormalizedContact) -> Vec<DuplicateMatch> {
        let mut best: HashMap<i64, (MatchType, f32)> = HashMap::new();
        let mut consider = |position: usize, match_type: MatchType, confidence: f32| {
            let id = self.contacts[position].id;
            let entry = best.entry(id).or_insert((match_type, confidence));
            if confidence > entry.1 {
                *entry = (match_type, confidence);
            }
        };

        let email = non_empty(&contact.normalized_email);
        let phone = non_empty(&contact.normalized_phone);

        if let Some(positions) = email.and_then(|e| self.by_email.get(e)) {
            for &position in positions {
                consider(position, MatchType::Email, EMAIL_MATCH_CONFIDENCE);
            }
        }

        if let Some(positions) = phone.and_then(|p| self.by_phone.get(p)) {
            for &position in positions {
                consider(position, MatchType::Phone, PHONE_MATCH_CONFIDENCE);
            }
        }

        let name_positions =
            non_empty(&contact.normalized_name).and_then(|n| self.by_name.get(n));
        if let Some(positions) = name_positions {
            for &position in positions {
                let existing = &self.contacts[position];
                let email_differs = differs(email, non_empty(&existing.normalized_email));
                let phone_differs = differs(phone, non_empty(&existing.normalized_phone));
                if email_differs || phone_differs {
                    consider(position, MatchType::Name, NAME_MATCH_CONFIDENCE);
                }
            }
        }

        let mut matches: Vec<DuplicateMatch> = best
            .into_iter()
            .map(|(contact_id, (match_type, confidence))| DuplicateMatch {
                contact_id,
                match_type,
                confidence,
                recommended_action: action_for_confidence(confidence),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(a.contact_id.cmp(&b.contact_id))
        });

        matches
    }

    /// Runs detection for a batch, keeping input order in the results
    pub fn check_batch(
        &self,
        contacts: &[NormalizedContact],
    ) -> (Vec<DuplicateCheckResult>, DuplicateCheckStats) {
        let started = Instant::now();
        let mut stats = DuplicateCheckStats {
            indexed_contacts: self.len() as u64,
            ..Default::default()
        };

        let results = contacts
            .iter()
            .enumerate()
            .map(|(index, contact)| {
                let duplicates = self.find_duplicates(contact);
                stats.total_checked += 1;
                if let Some(top) = duplicates.first() {
                    stats.with_duplicates += 1;
                    match top.match_type {
                        MatchType::Email => stats.email_matches += 1,
                        MatchType::Phone => stats.phone_matches += 1,
                        MatchType::Name => stats.name_matches += 1,
                    }
                }
                DuplicateCheckResult {
                    index,
                    has_duplicates: !duplicates.is_empty(),
                    recommended_action: recommend_action(&duplicates),
                    duplicates,
                }
            })
            .collect();

        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        (results, stats)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn differs(incoming: Option<&str>, existing: Option<&str>) -> bool {
    matches!((incoming, existing), (Some(a), Some(b)) if a != b)
}

/// 1.0 skips, anything from 0.8 up to (not including) 1.0 merges
pub fn action_for_confidence(confidence: f32) -> RecommendedAction {
    if confidence >= EMAIL_MATCH_CONFIDENCE {
        RecommendedAction::Skip
    } else if confidence >= NAME_MATCH_CONFIDENCE {
        RecommendedAction::Merge
    } else {
        RecommendedAction::Import
    }
}

/// Row-level recommendation from its ranked matches
pub fn recommend_action(matches: &[DuplicateMatch]) -> RecommendedAction {
    matches
        .first()
        .map(|top| top.recommended_action)
        .unwrap_or(RecommendedAction::Import)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact_csv::normalizer::dedup_hash;
    use std::time::Duration;

    fn existing(
        id: i64,
        organization_id: i64,
        email: Option<&str>,
        phone: Option<&str>,
        name: Option<&str>,
    ) -> ExistingContact {
        ExistingContact {
            id,
            organization_id,
            normalized_email: email.map(str::to_string),
            normalized_phone: phone.map(str::to_string),
            normalized_name: name.map(str::to_string),
        }
    }

    fn incoming(email: Option<&str>, phone: Option<&str>, name: Option<&str>) -> NormalizedContact {
        NormalizedContact {
            row_index: 1,
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            name: name.map(str::to_string),
            first_name: None,
            last_name: None,
            company: None,
            title: None,
            normalized_email: email.map(str::to_string),
            normalized_phone: phone.map(str::to_string),
            normalized_name: name.map(str::to_string),
            dedup_hash: dedup_hash(email, phone, name),
        }
    }

    #[test]
    fn test_email_match_skips() {
        let index = ContactIndex::build(
            1,
            vec![existing(10, 1, Some("j@x.com"), None, Some("john doe"))],
        );

        let matches = index.find_duplicates(&incoming(Some("j@x.com"), None, Some("john doe")));

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].contact_id, 10);
        assert_eq!(matches[0].match_type, MatchType::Email);
        assert_eq!(matches[0].confidence, 1.0);
        assert_eq!(matches[0].recommended_action, RecommendedAction::Skip);
        assert_eq!(recommend_action(&matches), RecommendedAction::Skip);
    }

    #[test]
    fn test_phone_match_merges() {
        let index = ContactIndex::build(1, vec![existing(10, 1, None, Some("5551234"), None)]);

        let matches = index.find_duplicates(&incoming(Some("a@b.co"), Some("5551234"), None));

        assert_eq!(matches[0].match_type, MatchType::Phone);
        assert_eq!(matches[0].confidence, 0.9);
        assert_eq!(matches[0].recommended_action, RecommendedAction::Merge);
    }

    #[test]
    fn test_name_match_requires_conflicting_contact_detail() {
        let index = ContactIndex::build(
            1,
            vec![
                existing(10, 1, Some("old@x.com"), None, Some("john doe")),
                existing(11, 1, None, None, Some("john doe")),
            ],
        );

        let matches = index.find_duplicates(&incoming(Some("new@x.com"), None, Some("john doe")));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].contact_id, 10);
        assert_eq!(matches[0].match_type, MatchType::Name);
        assert_eq!(matches[0].confidence, 0.8);
        assert_eq!(matches[0].recommended_action, RecommendedAction::Merge);

        let name_only = index.find_duplicates(&incoming(None, None, Some("john doe")));
        assert!(name_only.is_empty());
    }

    #[test]
    fn test_highest_tier_kept_per_contact() {
        let index = ContactIndex::build(
            1,
            vec![existing(10, 1, Some("j@x.com"), Some("5551234"), Some("john doe"))],
        );

        let matches = index.find_duplicates(&incoming(
            Some("j@x.com"),
            Some("5551234"),
            Some("john doe"),
        ));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].match_type, MatchType::Email);
    }

    #[test]
    fn test_matches_ordered_by_confidence() {
        let index = ContactIndex::build(
            1,
            vec![
                existing(30, 1, Some("other@x.com"), None, Some("john doe")),
                existing(20, 1, None, Some("5551234"), None),
                existing(10, 1, Some("j@x.com"), None, None),
            ],
        );

        let matches = index.find_duplicates(&incoming(
            Some("j@x.com"),
            Some("5551234"),
            Some("john doe"),
        ));

        let ids: Vec<i64> = matches.iter().map(|m| m.contact_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(recommend_action(&matches), RecommendedAction::Skip);
    }

    #[test]
    fn test_no_match_imports() {
        let index = ContactIndex::build(1, vec![existing(10, 1, Some("j@x.com"), None, None)]);
        let matches = index.find_duplicates(&incoming(Some("k@x.com"), None, None));

        assert!(matches.is_empty());
        assert_eq!(recommend_action(&matches), RecommendedAction::Import);
    }

    #[test]
    fn test_other_organizations_never_match() {
        let index = ContactIndex::build(
            1,
            vec![
                existing(10, 2, Some("shared@x.com"), None, None),
                existing(11, 1, Some("mine@x.com"), None, None),
            ],
        );

        assert_eq!(index.len(), 1);
        assert_eq!(index.organization_id(), 1);
        assert!(index
            .find_duplicates(&incoming(Some("shared@x.com"), None, None))
            .is_empty());
    }

    #[test]
    fn test_check_batch_stats() {
        let index = ContactIndex::build(
            1,
            vec![
                existing(10, 1, Some("j@x.com"), None, None),
                existing(11, 1, None, Some("999"), None),
            ],
        );

        let batch = vec![
            incoming(Some("j@x.com"), None, None),
            incoming(Some("new@x.com"), Some("999"), None),
            incoming(Some("fresh@x.com"), None, None),
        ];
        let (results, stats) = index.check_batch(&batch);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].index, 0);
        assert_eq!(results[0].recommended_action, RecommendedAction::Skip);
        assert_eq!(results[1].recommended_action, RecommendedAction::Merge);
        assert!(!results[2].has_duplicates);
        assert_eq!(results[2].recommended_action, RecommendedAction::Import);
        assert_eq!(stats.total_checked, 3);
        assert_eq!(stats.with_duplicates, 2);
        assert_eq!(stats.email_matches, 1);
        assert_eq!(stats.phone_matches, 1);
        assert_eq!(stats.indexed_contacts, 2);
    }

    #[test]
    fn test_thousand_rows_against_ten_thousand_contacts() {
        let contacts: Vec<ExistingContact> = (0..10_000)
            .map(|i| {
                let email = format!("person{}@example.com", i);
                let phone = format!("555{:07}", i);
                let name = format!("person {}", i);
                existing(i, 7, Some(&email), Some(&phone), Some(&name))
            })
            .collect();

        let batch: Vec<NormalizedContact> = (0..1_000)
            .map(|i| {
                let email = format!("person{}@example.com", i * 13);
                let phone = format!("555{:07}", i * 7);
                let name = format!("person {}", i * 3);
                incoming(Some(&email), Some(&phone), Some(&name))
            })
            .collect();

        let started = Instant::now();
        let index = ContactIndex::build(7, contacts);
        let (results, _) = index.check_batch(&batch);
        let elapsed = started.elapsed();

        assert_eq!(results.len(), 1_000);
        assert!(results.iter().all(|r| r.has_duplicates));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    }
}
