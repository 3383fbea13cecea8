#![forbid(unsafe_code)]

//! The plot-configuration state machine: a partial, possibly-incomplete
//! plot spec assembled one action at a time. The reducer is pure; history
//! and query-string synchronization belong to the caller. Unaffected
//! subtrees are shared through `Arc` so downstream change-detection can
//! compare by pointer.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dp_context::{Context, ContextEdit};
use dp_expr::{CompareOp, Comparison, Expr, Value, VariableRef, normalize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotType {
    Density1d,
    Scatter,
    CorrelationHeatmap,
}

impl PlotType {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Density1d => "density_1d",
            Self::Scatter => "scatter",
            Self::CorrelationHeatmap => "correlation_heatmap",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "density_1d" => Some(Self::Density1d),
            "scatter" => Some(Self::Scatter),
            "correlation_heatmap" => Some(Self::CorrelationHeatmap),
            _ => None,
        }
    }

    /// The dimension slots a plot of this type cannot render without.
    #[must_use]
    pub const fn required_slots(self) -> &'static [DimensionSlot] {
        match self {
            Self::Scatter => &[DimensionSlot::X, DimensionSlot::Y],
            Self::Density1d | Self::CorrelationHeatmap => &[DimensionSlot::X],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AxisType {
    #[default]
    Entity,
    Context,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DimensionSlot {
    X,
    Y,
    Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorBy {
    Entity,
    Context,
    Property,
    Custom,
}

impl ColorBy {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Context => "context",
            Self::Property => "property",
            Self::Custom => "custom",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "entity" => Some(Self::Entity),
            "context" => Some(Self::Context),
            "property" => Some(Self::Property),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    Alphabetical,
    MeanValuesAsc,
    MeanValuesDesc,
}

impl SortBy {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Alphabetical => "alphabetical",
            Self::MeanValuesAsc => "mean_values_asc",
            Self::MeanValuesDesc => "mean_values_desc",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "alphabetical" => Some(Self::Alphabetical),
            "mean_values_asc" => Some(Self::MeanValuesAsc),
            "mean_values_desc" => Some(Self::MeanValuesDesc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    First,
    Mean,
    Median,
}

/// A slice reference bound to a metadata slot (e.g. the color property).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRef {
    pub slice_id: String,
}

/// One axis of a plot: an entity or context bound to a dataset with an
/// aggregation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Dimension {
    pub axis_type: AxisType,
    pub entity_type: String,
    pub dataset_id: Option<String>,
    pub context: Option<Arc<Context>>,
    pub aggregation: Aggregation,
}

impl Dimension {
    #[must_use]
    pub fn new(axis_type: AxisType, entity_type: impl Into<String>) -> Self {
        Self {
            axis_type,
            entity_type: entity_type.into(),
            dataset_id: None,
            context: None,
            aggregation: Aggregation::default(),
        }
    }

    /// A dimension is plottable once a dataset is chosen and its context
    /// is present and complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.dataset_id.is_some()
            && self
                .context
                .as_ref()
                .is_some_and(|context| context.expr.is_complete())
    }
}

/// The full specification of a plot, partial while the user assembles it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotConfig {
    pub plot_type: PlotType,
    pub index_type: String,
    pub dimensions: BTreeMap<DimensionSlot, Arc<Dimension>>,
    pub color_by: Option<ColorBy>,
    pub sort_by: Option<SortBy>,
    pub filters: BTreeMap<String, Arc<Context>>,
    pub metadata: BTreeMap<String, SliceRef>,
    pub hide_points: bool,
    pub use_clustering: bool,
}

impl Default for PlotConfig {
    /// The documented default empty plot malformed URLs degrade to.
    fn default() -> Self {
        Self {
            plot_type: PlotType::Density1d,
            index_type: String::new(),
            dimensions: BTreeMap::new(),
            color_by: None,
            sort_by: None,
            filters: BTreeMap::new(),
            metadata: BTreeMap::new(),
            hide_points: false,
            use_clustering: false,
        }
    }
}

impl PlotConfig {
    /// Completeness is a pure predicate over the fields the current plot
    /// type requires; only complete plots are serialized or fetched for.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.index_type.is_empty()
            && self.plot_type.required_slots().iter().all(|slot| {
                self.dimensions
                    .get(slot)
                    .is_some_and(|dimension| dimension.is_complete())
            })
    }
}

/// A dimension or filter slot holding a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPath {
    Dimension(DimensionSlot),
    Filter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Negated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMatch {
    pub path: SlotPath,
    pub kind: MatchKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlotAction {
    /// Full replacement, e.g. the config parsed from the URL on load.
    SetPlot(PlotConfig),
    SelectPlotType(PlotType),
    SelectAxisType {
        slot: DimensionSlot,
        axis_type: AxisType,
        entity_type: String,
    },
    SelectDatasetId {
        slot: DimensionSlot,
        dataset_id: Option<String>,
    },
    SelectContext {
        slot: SlotPath,
        context: Option<Context>,
    },
    SelectEntityLabel {
        slot: DimensionSlot,
        entity_label: Option<String>,
    },
    SelectAggregation {
        slot: DimensionSlot,
        aggregation: Aggregation,
    },
    SelectColorBy(Option<ColorBy>),
    SelectColorProperty {
        slot: String,
        slice: Option<SliceRef>,
    },
    SelectSortBy(Option<SortBy>),
    SelectHidePoints(bool),
    SelectUseClustering(bool),
    SwapAxes,
}

/// The reducer's result: the next config plus a signal that previously
/// fetched data no longer matches the config shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduced {
    pub config: PlotConfig,
    pub data_invalidated: bool,
}

impl Reduced {
    fn unchanged_shape(config: PlotConfig) -> Self {
        Self {
            config,
            data_invalidated: false,
        }
    }
}

/// Pure state transition. Never performs I/O; the caller decides whether
/// the transition warrants a history push or a refetch.
#[must_use]
pub fn reduce(config: &PlotConfig, action: &PlotAction) -> Reduced {
    match action {
        PlotAction::SetPlot(next) => Reduced::unchanged_shape(next.clone()),
        PlotAction::SelectPlotType(plot_type) => {
            let data_invalidated =
                config.plot_type.required_slots() != plot_type.required_slots();
            let mut next = config.clone();
            next.plot_type = *plot_type;
            Reduced {
                config: next,
                data_invalidated,
            }
        }
        PlotAction::SelectAxisType {
            slot,
            axis_type,
            entity_type,
        } => Reduced::unchanged_shape(with_dimension(config, *slot, |dimension| {
            *dimension = Dimension::new(*axis_type, entity_type.clone());
        })),
        PlotAction::SelectDatasetId { slot, dataset_id } => {
            Reduced::unchanged_shape(with_dimension(config, *slot, |dimension| {
                dimension.dataset_id = dataset_id.clone();
            }))
        }
        PlotAction::SelectContext { slot, context } => {
            let mut next = config.clone();
            match slot {
                SlotPath::Dimension(slot) => {
                    next = with_dimension(&next, *slot, |dimension| {
                        dimension.context = context.clone().map(Arc::new);
                    });
                }
                SlotPath::Filter(name) => match context {
                    Some(context) => {
                        next.filters.insert(name.clone(), Arc::new(context.clone()));
                    }
                    None => {
                        next.filters.remove(name);
                    }
                },
            }
            Reduced::unchanged_shape(next)
        }
        PlotAction::SelectEntityLabel { slot, entity_label } => {
            Reduced::unchanged_shape(with_dimension(config, *slot, |dimension| {
                dimension.context = entity_label
                    .as_ref()
                    .map(|label| Arc::new(entity_label_context(&dimension.entity_type, label)));
            }))
        }
        PlotAction::SelectAggregation { slot, aggregation } => {
            Reduced::unchanged_shape(with_dimension(config, *slot, |dimension| {
                dimension.aggregation = *aggregation;
            }))
        }
        PlotAction::SelectColorBy(color_by) => {
            let mut next = config.clone();
            next.color_by = *color_by;
            Reduced::unchanged_shape(next)
        }
        PlotAction::SelectColorProperty { slot, slice } => {
            let mut next = config.clone();
            match slice {
                Some(slice) => {
                    next.metadata.insert(slot.clone(), slice.clone());
                }
                None => {
                    next.metadata.remove(slot);
                }
            }
            Reduced::unchanged_shape(next)
        }
        PlotAction::SelectSortBy(sort_by) => {
            let mut next = config.clone();
            next.sort_by = *sort_by;
            Reduced::unchanged_shape(next)
        }
        PlotAction::SelectHidePoints(hide_points) => {
            let mut next = config.clone();
            next.hide_points = *hide_points;
            Reduced::unchanged_shape(next)
        }
        PlotAction::SelectUseClustering(use_clustering) => {
            let mut next = config.clone();
            next.use_clustering = *use_clustering;
            Reduced::unchanged_shape(next)
        }
        PlotAction::SwapAxes => Reduced::unchanged_shape(swap_axes(config)),
    }
}

/// Copy-on-write update of one dimension slot; every other subtree keeps
/// its `Arc` identity.
fn with_dimension(
    config: &PlotConfig,
    slot: DimensionSlot,
    edit: impl FnOnce(&mut Dimension),
) -> PlotConfig {
    let mut next = config.clone();
    let entry = next
        .dimensions
        .entry(slot)
        .or_insert_with(|| Arc::new(Dimension::default()));
    edit(Arc::make_mut(entry));
    next
}

/// The anonymous context selecting a single entity by label.
#[must_use]
pub fn entity_label_context(entity_type: &str, label: &str) -> Context {
    Context {
        name: label.to_owned(),
        context_type: entity_type.to_owned(),
        expr: Expr::Comparison(Comparison {
            op: CompareOp::Eq,
            left: Some(VariableRef::EntityLabel),
            right: Some(Value::Str(label.to_owned())),
        }),
    }
}

/// Exchanges the x and y subtrees verbatim, contexts and aggregations
/// included. The color dimension is never swapped.
#[must_use]
pub fn swap_axes(config: &PlotConfig) -> PlotConfig {
    let mut next = config.clone();
    let x = next.dimensions.remove(&DimensionSlot::X);
    let y = next.dimensions.remove(&DimensionSlot::Y);
    if let Some(y) = y {
        next.dimensions.insert(DimensionSlot::X, y);
    }
    if let Some(x) = x {
        next.dimensions.insert(DimensionSlot::Y, x);
    }
    next
}

fn contexts_match(slot: &Context, probe: &Context) -> Option<MatchKind> {
    if slot.context_type != probe.context_type {
        return None;
    }
    let slot_expr = normalize(slot.expr.clone());
    let probe_expr = normalize(probe.expr.clone());
    if slot_expr == probe_expr {
        return Some(MatchKind::Exact);
    }
    // A single negation wrapper in either direction counts as linked;
    // deeper wrappers are out of contract.
    if let Expr::Not(inner) = &slot_expr
        && **inner == probe_expr
    {
        return Some(MatchKind::Negated);
    }
    if let Expr::Not(inner) = &probe_expr
        && **inner == slot_expr
    {
        return Some(MatchKind::Negated);
    }
    None
}

/// Structural search over every dimension and filter slot for contexts
/// equal to the probe or to its single negation.
#[must_use]
pub fn find_paths_to_context(config: &PlotConfig, probe: &Context) -> Vec<ContextMatch> {
    let mut matches = Vec::new();
    for (slot, dimension) in &config.dimensions {
        if let Some(context) = dimension.context.as_deref()
            && let Some(kind) = contexts_match(context, probe)
        {
            matches.push(ContextMatch {
                path: SlotPath::Dimension(*slot),
                kind,
            });
        }
    }
    for (name, context) in &config.filters {
        if let Some(kind) = contexts_match(context, probe) {
            matches.push(ContextMatch {
                path: SlotPath::Filter(name.clone()),
                kind,
            });
        }
    }
    matches
}

/// Rewrites every slot currently holding the edited context (or its
/// negation) to the new version, preserving negation wrappers. Slots
/// holding unrelated contexts keep their `Arc` identity.
#[must_use]
pub fn apply_context_edit(config: &PlotConfig, edit: &ContextEdit) -> PlotConfig {
    let mut next = config.clone();
    for found in find_paths_to_context(config, &edit.previous) {
        let replacement = match found.kind {
            MatchKind::Exact => edit.current.clone(),
            MatchKind::Negated => edit.current.negated(),
        };
        match found.path {
            SlotPath::Dimension(slot) => {
                next = with_dimension(&next, slot, |dimension| {
                    dimension.context = Some(Arc::new(replacement.clone()));
                });
            }
            SlotPath::Filter(name) => {
                next.filters.insert(name, Arc::new(replacement));
            }
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dp_context::{Context, ContextEdit};
    use dp_expr::{CompareOp, Comparison, Expr, Value, VariableRef};

    use super::{
        Aggregation, AxisType, ColorBy, ContextMatch, Dimension, DimensionSlot, MatchKind,
        PlotAction, PlotConfig, PlotType, SliceRef, SlotPath, apply_context_edit,
        entity_label_context, find_paths_to_context, reduce,
    };

    fn gene_context(name: &str, label: &str) -> Context {
        Context {
            name: name.to_owned(),
            context_type: "gene".to_owned(),
            expr: Expr::Comparison(Comparison {
                op: CompareOp::Eq,
                left: Some(VariableRef::EntityLabel),
                right: Some(Value::Str(label.to_owned())),
            }),
        }
    }

    fn dimension_with(context: Context) -> Arc<Dimension> {
        Arc::new(Dimension {
            axis_type: AxisType::Entity,
            entity_type: "gene".to_owned(),
            dataset_id: Some("expression".to_owned()),
            context: Some(Arc::new(context)),
            aggregation: Aggregation::First,
        })
    }

    fn scatter_config() -> PlotConfig {
        let mut config = PlotConfig {
            plot_type: PlotType::Scatter,
            index_type: "depmap_model".to_owned(),
            ..PlotConfig::default()
        };
        config
            .dimensions
            .insert(DimensionSlot::X, dimension_with(gene_context("a", "SOX10")));
        config
            .dimensions
            .insert(DimensionSlot::Y, dimension_with(gene_context("b", "BRAF")));
        config
    }

    #[test]
    fn scatter_completeness_requires_both_axes() {
        let mut config = scatter_config();
        assert!(config.is_complete());

        config.dimensions.remove(&DimensionSlot::Y);
        assert!(!config.is_complete());

        config.plot_type = PlotType::CorrelationHeatmap;
        assert!(config.is_complete());
    }

    #[test]
    fn swap_axes_exchanges_subtrees_and_leaves_color_alone() {
        let mut config = scatter_config();
        let color = dimension_with(gene_context("c", "NRAS"));
        config.dimensions.insert(DimensionSlot::Color, color.clone());

        let a = config.dimensions[&DimensionSlot::X].clone();
        let b = config.dimensions[&DimensionSlot::Y].clone();

        let swapped = reduce(&config, &PlotAction::SwapAxes).config;
        assert!(Arc::ptr_eq(&swapped.dimensions[&DimensionSlot::X], &b));
        assert!(Arc::ptr_eq(&swapped.dimensions[&DimensionSlot::Y], &a));
        assert!(Arc::ptr_eq(&swapped.dimensions[&DimensionSlot::Color], &color));
    }

    #[test]
    fn plot_type_change_signals_invalidation_only_on_shape_change() {
        let config = scatter_config();
        let narrowed = reduce(&config, &PlotAction::SelectPlotType(PlotType::Density1d));
        assert!(narrowed.data_invalidated);

        let same_shape = reduce(
            &narrowed.config,
            &PlotAction::SelectPlotType(PlotType::CorrelationHeatmap),
        );
        assert!(!same_shape.data_invalidated);
    }

    #[test]
    fn unrelated_subtrees_keep_their_arc_identity() {
        let config = scatter_config();
        let y_before = config.dimensions[&DimensionSlot::Y].clone();

        let next = reduce(
            &config,
            &PlotAction::SelectAggregation {
                slot: DimensionSlot::X,
                aggregation: Aggregation::Mean,
            },
        )
        .config;

        assert!(Arc::ptr_eq(&next.dimensions[&DimensionSlot::Y], &y_before));
        assert_eq!(
            next.dimensions[&DimensionSlot::X].aggregation,
            Aggregation::Mean
        );
    }

    #[test]
    fn select_entity_label_builds_the_label_context() {
        let config = scatter_config();
        let next = reduce(
            &config,
            &PlotAction::SelectEntityLabel {
                slot: DimensionSlot::X,
                entity_label: Some("MDM2".to_owned()),
            },
        )
        .config;
        let context = next.dimensions[&DimensionSlot::X]
            .context
            .as_deref()
            .expect("context set");
        assert_eq!(context, &entity_label_context("gene", "MDM2"));
    }

    #[test]
    fn find_paths_locates_exact_and_negated_slots() {
        let probe = gene_context("probe", "SOX10");
        let mut config = scatter_config();
        config
            .dimensions
            .insert(DimensionSlot::X, dimension_with(probe.clone()));
        config
            .filters
            .insert("color1".to_owned(), Arc::new(probe.negated()));

        let matches = find_paths_to_context(&config, &probe);
        assert!(matches.contains(&ContextMatch {
            path: SlotPath::Dimension(DimensionSlot::X),
            kind: MatchKind::Exact,
        }));
        assert!(matches.contains(&ContextMatch {
            path: SlotPath::Filter("color1".to_owned()),
            kind: MatchKind::Negated,
        }));
        // The y slot holds an unrelated context and stays out.
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn context_edit_rewrites_located_slots_preserving_negation() {
        let before = gene_context("probe", "SOX10");
        let after = gene_context("probe", "MITF");
        let mut config = scatter_config();
        config
            .dimensions
            .insert(DimensionSlot::X, dimension_with(before.clone()));
        config
            .filters
            .insert("color1".to_owned(), Arc::new(before.negated()));
        let untouched = config.dimensions[&DimensionSlot::Y].clone();

        let next = apply_context_edit(
            &config,
            &ContextEdit {
                previous: before,
                current: after.clone(),
            },
        );

        assert_eq!(
            next.dimensions[&DimensionSlot::X].context.as_deref(),
            Some(&after)
        );
        assert_eq!(next.filters["color1"].as_ref(), &after.negated());
        assert!(Arc::ptr_eq(&next.dimensions[&DimensionSlot::Y], &untouched));
    }

    #[test]
    fn filter_and_metadata_slots_set_and_clear() {
        let config = scatter_config();
        let filter = gene_context("f", "TP53");

        let with_filter = reduce(
            &config,
            &PlotAction::SelectContext {
                slot: SlotPath::Filter("visible".to_owned()),
                context: Some(filter.clone()),
            },
        )
        .config;
        assert_eq!(with_filter.filters["visible"].as_ref(), &filter);

        let cleared = reduce(
            &with_filter,
            &PlotAction::SelectContext {
                slot: SlotPath::Filter("visible".to_owned()),
                context: None,
            },
        )
        .config;
        assert!(cleared.filters.is_empty());

        let with_property = reduce(
            &cleared,
            &PlotAction::SelectColorProperty {
                slot: "color_property".to_owned(),
                slice: Some(SliceRef {
                    slice_id: "slice/metadata/lineage/label".to_owned(),
                }),
            },
        )
        .config;
        assert_eq!(
            with_property.metadata["color_property"].slice_id,
            "slice/metadata/lineage/label"
        );
    }

    #[test]
    fn color_by_and_mode_flags_round_trip_through_the_reducer() {
        let config = scatter_config();
        let next = reduce(&config, &PlotAction::SelectColorBy(Some(ColorBy::Context))).config;
        let next = reduce(&next, &PlotAction::SelectHidePoints(true)).config;
        let next = reduce(&next, &PlotAction::SelectUseClustering(true)).config;
        assert_eq!(next.color_by, Some(ColorBy::Context));
        assert!(next.hide_points);
        assert!(next.use_clustering);
    }
}
