//! Applies change records to a [`VersionedGraph`].
//!
//! A batch is handled in two passes. The first pass sorts node records by
//! their change timestamp and creates or updates one entity per record. The
//! second pass creates the relationships embedded in the records, once every
//! endpoint the batch mentions has had a chance to exist.
//!
//! Kinds are learned from the data: the first record of a kind registers it
//! with property types inferred from the values, and later records extend it
//! with keys it has not seen before.

use super::record::{
    ChangeRecord, RelatedLink, SEMANTIC_ACTION_DESCRIPTION_KEY, SEMANTIC_ACTION_KEY, TL_CHANGE_KEY,
};
use super::semantic_action;
use super::source::RecordSource;
use crate::config::IngestConfig;
use crate::models::{EntityId, PropertyMap, PropertyValue};
use crate::ontology::{PropertySpec, PropertySpecs};
use crate::query::sanitize;
use crate::services::VersionedGraph;
use crate::storage::{EntityIndex, NAME_TAG};
use crate::{Outcome, Result};
use chrono::SubsecRound;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Counts of what a batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Entities created.
    pub created: usize,
    /// Entities that received a new state.
    pub updated: usize,
    /// Records that repeated the current state.
    pub unchanged: usize,
    /// Records dropped for their semantic action or kind.
    pub ignored: usize,
    /// Relationships created.
    pub relationships_created: usize,
    /// Relationships that already existed.
    pub duplicate_relationships: usize,
    /// Relationships with an endpoint missing from the graph.
    pub dangling_relationships: usize,
    /// Records or relationships that failed.
    pub failed: usize,
}

impl IngestReport {
    /// Adds another report's counts to this one.
    pub const fn merge(&mut self, other: &Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.ignored += other.ignored;
        self.relationships_created += other.relationships_created;
        self.duplicate_relationships += other.duplicate_relationships;
        self.dangling_relationships += other.dangling_relationships;
        self.failed += other.failed;
    }

    /// Returns `true` if nothing was written.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.relationships_created == 0
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created {}, updated {}, unchanged {}, ignored {}, relationships {} \
             (duplicate {}, dangling {}), failed {}",
            self.created,
            self.updated,
            self.unchanged,
            self.ignored,
            self.relationships_created,
            self.duplicate_relationships,
            self.dangling_relationships,
            self.failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOutcome {
    Created,
    Duplicate,
    Dangling,
}

/// Maps external change records onto the graph.
pub struct Connector {
    graph: Arc<VersionedGraph>,
    config: IngestConfig,
    index: Option<(Arc<dyn EntityIndex>, String)>,
}

impl Connector {
    /// Creates a connector writing to `graph`.
    #[must_use]
    pub fn new(graph: Arc<VersionedGraph>, config: IngestConfig) -> Self {
        Self {
            graph,
            config,
            index: None,
        }
    }

    /// Also indexes record titles under [`NAME_TAG`] for `user_id`.
    #[must_use]
    pub fn with_entity_index(mut self, index: Arc<dyn EntityIndex>, user_id: impl Into<String>) -> Self {
        self.index = Some((index, user_id.into()));
        self
    }

    /// Returns the target graph.
    #[must_use]
    pub fn graph(&self) -> &VersionedGraph {
        &self.graph
    }

    /// Returns the connector settings.
    #[must_use]
    pub const fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Reads one batch from `source` and applies it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the source cannot be read. Failing records
    /// are counted in the report.
    pub fn ingest_source(&self, source: &mut dyn RecordSource) -> Result<IngestReport> {
        let values = source.next_batch()?;
        Ok(self.ingest_values(&values))
    }

    /// Polls `source` every `poll_interval` until `max_polls` is reached.
    ///
    /// Read errors are logged and the next poll retries.
    pub fn run_polling(&self, source: &mut dyn RecordSource) -> IngestReport {
        let mut total = IngestReport::default();
        let mut polls: u64 = 0;
        while self.config.max_polls.is_none_or(|max| polls < max) {
            std::thread::sleep(self.config.poll_interval);
            polls += 1;
            debug!(poll = polls, "Reading data");
            match self.ingest_source(source) {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    warn!(error = %e, "Reading the record source failed, retrying on the next poll");
                    metrics::counter!("kg_ingest_source_errors_total").increment(1);
                },
            }
        }
        total
    }

    /// Parses and applies raw JSON records.
    pub fn ingest_values(&self, values: &[Value]) -> IngestReport {
        let mut report = IngestReport::default();
        let mut records = Vec::with_capacity(values.len());
        for value in values {
            match ChangeRecord::from_json(value, &self.config.immutable_keys) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(error = %e, "Skipping unparsable record");
                    record_skipped("unparsable");
                    report.failed += 1;
                },
            }
        }
        report.merge(&self.ingest_records(records));
        report
    }

    /// Applies parsed records.
    ///
    /// Records are applied in change-timestamp order. Relationships are
    /// applied after all node records.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub fn ingest_records(&self, mut records: Vec<ChangeRecord>) -> IngestReport {
        let mut report = IngestReport::default();
        records.retain(|record| {
            let ignored = self.is_ignored(record);
            if ignored {
                report.ignored += 1;
            }
            !ignored
        });
        records.sort_by_key(|record| record.changed_at);

        let mut titles = BTreeSet::new();
        for record in &records {
            match self.apply_record(record) {
                Ok(outcome) => {
                    match outcome {
                        NodeOutcome::Created => report.created += 1,
                        NodeOutcome::Updated => report.updated += 1,
                        NodeOutcome::Unchanged => report.unchanged += 1,
                    }
                    if outcome != NodeOutcome::Unchanged {
                        if let Some(title) = record.title() {
                            titles.insert(title.to_string());
                        }
                    }
                },
                Err(e) => {
                    warn!(entity_id = %record.id, error = %e, "Record could not be applied");
                    record_skipped("failed");
                    report.failed += 1;
                },
            }
        }

        for record in &records {
            for link in &record.related {
                match self.apply_link(record, link) {
                    Ok(LinkOutcome::Created) => report.relationships_created += 1,
                    Ok(LinkOutcome::Duplicate) => report.duplicate_relationships += 1,
                    Ok(LinkOutcome::Dangling) => report.dangling_relationships += 1,
                    Err(e) => {
                        warn!(entity_id = %record.id, relation = %link.relation, error = %e, "Relationship could not be applied");
                        report.failed += 1;
                    },
                }
            }
        }

        if !titles.is_empty() {
            info!(?titles, "Changes inserted");
        }
        info!(%report, "Batch ingested");
        report
    }

    /// Returns `false` if `updates` repeat the current state of `id`.
    ///
    /// A change is not novel when the current state has the same
    /// `SemanticAction` and the same `TLChange` to the second.
    ///
    /// # Errors
    ///
    /// Returns an error if the current state cannot be read.
    pub fn check_updates_novelty(&self, id: &EntityId, updates: &PropertyMap) -> Result<bool> {
        let Some(current) = self.graph.store().current_state(id)? else {
            return Ok(true);
        };
        let same_action = current.get(SEMANTIC_ACTION_KEY) == updates.get(SEMANTIC_ACTION_KEY);
        let same_change = match (current.get(TL_CHANGE_KEY), updates.get(TL_CHANGE_KEY)) {
            (Some(PropertyValue::DateTime(stored)), Some(PropertyValue::DateTime(incoming))) => {
                stored.trunc_subsecs(0) == incoming.trunc_subsecs(0)
            },
            _ => false,
        };
        if same_action && same_change {
            warn!(entity_id = %id, "An attempt to update using the same value of TLChange");
            return Ok(false);
        }
        Ok(true)
    }

    fn is_ignored(&self, record: &ChangeRecord) -> bool {
        if self.config.ignored_actions.contains(&record.semantic_action) {
            debug!(entity_id = %record.id, action = record.semantic_action, "Ignoring semantic action");
            record_skipped("ignored_action");
            return true;
        }
        if self.config.ignored_kinds.iter().any(|kind| *kind == record.kind) {
            debug!(entity_id = %record.id, kind = %record.kind, "Ignoring kind");
            record_skipped("ignored_kind");
            return true;
        }
        false
    }

    fn apply_record(&self, record: &ChangeRecord) -> Result<NodeOutcome> {
        let mut properties = sanitize::keys(&record.properties);
        properties.insert(
            SEMANTIC_ACTION_DESCRIPTION_KEY.to_string(),
            PropertyValue::String(semantic_action::describe(record.semantic_action).unwrap_or_default()),
        );

        let outcome = if let Some(entity) = self.graph.store().get_entity(&record.id)? {
            if !self.check_updates_novelty(&record.id, &properties)? {
                record_skipped("unchanged");
                return Ok(NodeOutcome::Unchanged);
            }
            self.learn_kind(&entity.kind, &properties)?;
            self.graph
                .update_properties(&record.id, &properties, Some(record.changed_at))?;
            NodeOutcome::Updated
        } else {
            let kind = sanitize::identifier(&record.kind);
            let immutable = sanitize::keys(&record.immutable);
            let mut declared = immutable.clone();
            declared.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
            self.learn_kind(&kind, &declared)?;
            let created_at = record.created_at.unwrap_or(record.changed_at);
            match self.graph.create_entity_with_immutable(
                &kind,
                &record.id,
                immutable,
                properties,
                Some(created_at),
            )? {
                Outcome::Applied(_) => NodeOutcome::Created,
                Outcome::Skipped(_) => NodeOutcome::Unchanged,
            }
        };

        if outcome != NodeOutcome::Unchanged {
            let label = if outcome == NodeOutcome::Created { "created" } else { "updated" };
            metrics::counter!("kg_ingest_records_applied_total", "outcome" => label).increment(1);
            self.index_title(record);
        }
        Ok(outcome)
    }

    /// Registers `kind`, or declares keys it does not know yet.
    fn learn_kind(&self, kind: &str, properties: &PropertyMap) -> Result<()> {
        let ontology = self.graph.ontology();
        let inferred = infer_specs(properties);
        if !ontology.has_kind(kind) {
            if let Outcome::Applied(()) = ontology.create_entity_kind_with_specs(kind, None, inferred)? {
                info!(kind = %kind, "Kind learned from ingested records");
            }
            return Ok(());
        }
        let declared = ontology.get_kind_properties(kind).unwrap_or_default();
        let missing: PropertySpecs = inferred
            .into_iter()
            .filter(|(key, _)| !declared.contains_key(key))
            .collect();
        if !missing.is_empty() {
            debug!(kind = %kind, properties = ?missing.keys().collect::<Vec<_>>(), "Declaring new properties");
            ontology.create_entity_kind_properties_with_specs(kind, missing)?;
        }
        Ok(())
    }

    fn apply_link(&self, record: &ChangeRecord, link: &RelatedLink) -> Result<LinkOutcome> {
        let (from, to) = record.endpoints(link);
        let store = self.graph.store();
        let (Some(entity_a), Some(entity_b)) = (store.get_entity(&from)?, store.get_entity(&to)?)
        else {
            debug!(from = %from, relation = %link.relation, to = %to, "Relationship endpoint is not in the graph");
            return Ok(LinkOutcome::Dangling);
        };

        let properties = sanitize::keys(&link.properties);
        if let Outcome::Applied(()) = self.graph.ontology().create_relationship_kind(
            &entity_a.kind,
            &link.relation,
            &entity_b.kind,
            infer_specs(&properties),
        )? {
            debug!(relation = %link.relation, "Relationship kind learned from ingested records");
        }

        // Links follow every node of the batch, so the source may already be
        // newer than the record.
        let at = match store.current_state(&from)? {
            Some(current) => record.changed_at.max(current.validity.start),
            None => record.changed_at,
        };
        match self
            .graph
            .create_relationship(&from, &link.relation, &to, properties, Some(at))?
        {
            Outcome::Applied(_) => Ok(LinkOutcome::Created),
            Outcome::Skipped(_) => Ok(LinkOutcome::Duplicate),
        }
    }

    fn index_title(&self, record: &ChangeRecord) {
        let (Some((index, user_id)), Some(title)) = (&self.index, record.title()) else {
            return;
        };
        if let Err(e) = index.add_entities(
            user_id,
            &[title.to_string()],
            &[record.id.clone()],
            &[NAME_TAG.to_string()],
        ) {
            warn!(entity_id = %record.id, error = %e, "Title could not be indexed");
        }
    }
}

fn infer_specs(properties: &PropertyMap) -> PropertySpecs {
    properties
        .iter()
        .map(|(key, value)| (key.clone(), PropertySpec::new(value.property_type())))
        .collect()
}

fn record_skipped(reason: &'static str) {
    metrics::counter!("kg_ingest_records_skipped_total", "reason" => reason).increment(1);
}
