//! Dynamic branching algebra.
//!
//! A [`PatternSpec`] is a small expression tree over target names.
//! [`resolve_pattern_shape`] evaluates it into an ordered list of
//! [`BranchShape`]s describing which slice of which upstream each
//! branch consumes. Nothing executes during resolution, so the same
//! function backs both the scheduler and dry-run validation.

use crate::error::PatternError;
use crate::record::value_digest;
use crate::target::Iteration;
use crate::value::Value;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Tagged expression tree describing how a pattern branches over its
/// upstream targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatternSpec {
    /// A plain upstream target name
    Leaf { name: String },
    /// One branch per index, all arguments sliced in lockstep
    Map { args: Vec<PatternSpec> },
    /// Full cross-product of the arguments, rightmost varying fastest
    Cross { args: Vec<PatternSpec> },
    /// First `n` branches of the inner pattern by creation order
    Head { inner: Box<PatternSpec>, n: usize },
    /// Last `n` branches of the inner pattern by creation order
    Tail { inner: Box<PatternSpec>, n: usize },
    /// `n` branches sampled without replacement, seeded
    Sample {
        inner: Box<PatternSpec>,
        n: usize,
        seed: u64,
    },
}

impl PatternSpec {
    pub fn leaf(name: impl Into<String>) -> Self {
        PatternSpec::Leaf { name: name.into() }
    }

    pub fn map<I>(args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PatternSpec>,
    {
        PatternSpec::Map {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn cross<I>(args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PatternSpec>,
    {
        PatternSpec::Cross {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn head(inner: impl Into<PatternSpec>, n: usize) -> Self {
        PatternSpec::Head {
            inner: Box::new(inner.into()),
            n,
        }
    }

    pub fn tail(inner: impl Into<PatternSpec>, n: usize) -> Self {
        PatternSpec::Tail {
            inner: Box::new(inner.into()),
            n,
        }
    }

    pub fn sample(inner: impl Into<PatternSpec>, n: usize, seed: u64) -> Self {
        PatternSpec::Sample {
            inner: Box::new(inner.into()),
            n,
            seed,
        }
    }

    /// Whether any sub-expression selects branches at random.
    pub fn uses_sample(&self) -> bool {
        match self {
            PatternSpec::Sample { .. } => true,
            PatternSpec::Leaf { .. } => false,
            PatternSpec::Map { args } | PatternSpec::Cross { args } => {
                args.iter().any(PatternSpec::uses_sample)
            }
            PatternSpec::Head { inner, .. } | PatternSpec::Tail { inner, .. } => {
                inner.uses_sample()
            }
        }
    }

    /// Leaf target names in first-appearance order, deduplicated.
    pub fn leaves(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        self.collect_leaves(&mut seen, &mut out);
        out
    }

    fn collect_leaves(&self, seen: &mut BTreeSet<String>, out: &mut Vec<String>) {
        match self {
            PatternSpec::Leaf { name } => {
                if seen.insert(name.clone()) {
                    out.push(name.clone());
                }
            }
            PatternSpec::Map { args } | PatternSpec::Cross { args } => {
                for arg in args {
                    arg.collect_leaves(seen, out);
                }
            }
            PatternSpec::Head { inner, .. }
            | PatternSpec::Tail { inner, .. }
            | PatternSpec::Sample { inner, .. } => inner.collect_leaves(seen, out),
        }
    }
}

impl From<&str> for PatternSpec {
    fn from(name: &str) -> Self {
        PatternSpec::leaf(name)
    }
}

impl From<String> for PatternSpec {
    fn from(name: String) -> Self {
        PatternSpec::leaf(name)
    }
}

impl fmt::Display for PatternSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(args: &[PatternSpec]) -> String {
            args.iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            PatternSpec::Leaf { name } => write!(f, "{name}"),
            PatternSpec::Map { args } => write!(f, "map({})", join(args)),
            PatternSpec::Cross { args } => write!(f, "cross({})", join(args)),
            PatternSpec::Head { inner, n } => write!(f, "head({inner}, {n})"),
            PatternSpec::Tail { inner, n } => write!(f, "tail({inner}, {n})"),
            PatternSpec::Sample { inner, n, seed } => {
                write!(f, "sample({inner}, {n}, seed={seed})")
            }
        }
    }
}

/// Slice addressing within an upstream target's value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum SliceKey {
    /// Positional slice under vector/list iteration
    Index(usize),
    /// Keyed slice under group iteration
    Group(String),
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceKey::Index(i) => write!(f, "{i}"),
            SliceKey::Group(k) => write!(f, "{k}"),
        }
    }
}

/// One slice of one upstream target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceRef {
    pub target: String,
    pub key: SliceKey,
}

/// The ordered tuple of upstream slices one branch consumes. Position
/// in the resolved list is the branch's creation index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchShape {
    pub slices: Vec<SliceRef>,
}

/// Slice availability of one upstream target: a plain count under
/// vector/list iteration, or the ordered distinct group keys under
/// group iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgShape {
    Len(usize),
    Groups(Vec<String>),
}

impl ArgShape {
    pub fn count(&self) -> usize {
        match self {
            ArgShape::Len(n) => *n,
            ArgShape::Groups(keys) => keys.len(),
        }
    }
}

/// Pure validation entry point: resolve a pattern specification into
/// its ordered branch list given only upstream slice availability.
///
/// `sample()` sub-expressions use their declared seed alone; use
/// [`resolve_pattern_shape_seeded`] to mix in the pattern name and
/// run seed the way the scheduler does.
pub fn resolve_pattern_shape(
    spec: &PatternSpec,
    shapes: &HashMap<String, ArgShape>,
) -> Result<Vec<BranchShape>, PatternError> {
    resolve_pattern_shape_seeded(spec, shapes, "", 0)
}

/// Resolve a pattern with `sample()` seeds derived from the pattern
/// target's name and the run seed, so selection is reproducible across
/// runs with unchanged inputs.
pub fn resolve_pattern_shape_seeded(
    spec: &PatternSpec,
    shapes: &HashMap<String, ArgShape>,
    pattern_name: &str,
    run_seed: u64,
) -> Result<Vec<BranchShape>, PatternError> {
    let ctx = ResolveCtx {
        shapes,
        pattern_name,
        run_seed,
    };
    resolve(spec, &ctx)
}

struct ResolveCtx<'a> {
    shapes: &'a HashMap<String, ArgShape>,
    pattern_name: &'a str,
    run_seed: u64,
}

fn resolve(spec: &PatternSpec, ctx: &ResolveCtx<'_>) -> Result<Vec<BranchShape>, PatternError> {
    match spec {
        PatternSpec::Leaf { name } => {
            let shape = ctx
                .shapes
                .get(name)
                .ok_or_else(|| PatternError::UnknownSymbol(name.clone()))?;
            let branches = match shape {
                ArgShape::Len(n) => (0..*n)
                    .map(|i| BranchShape {
                        slices: vec![SliceRef {
                            target: name.clone(),
                            key: SliceKey::Index(i),
                        }],
                    })
                    .collect(),
                ArgShape::Groups(keys) => keys
                    .iter()
                    .map(|k| BranchShape {
                        slices: vec![SliceRef {
                            target: name.clone(),
                            key: SliceKey::Group(k.clone()),
                        }],
                    })
                    .collect(),
            };
            Ok(branches)
        }

        PatternSpec::Map { args } => {
            let resolved: Vec<Vec<BranchShape>> = args
                .iter()
                .map(|arg| resolve(arg, ctx))
                .collect::<Result<_, _>>()?;

            let len = resolved.first().map(|r| r.len()).unwrap_or(0);
            if resolved.iter().any(|r| r.len() != len) {
                return Err(PatternError::LengthMismatch {
                    pattern: ctx.pattern_name.to_string(),
                    counts: args
                        .iter()
                        .zip(&resolved)
                        .map(|(arg, r)| (arg.to_string(), r.len()))
                        .collect(),
                });
            }

            let mut branches = Vec::with_capacity(len);
            for i in 0..len {
                let mut slices = Vec::new();
                for arg in &resolved {
                    slices.extend(arg[i].slices.iter().cloned());
                }
                branches.push(BranchShape { slices });
            }
            Ok(branches)
        }

        PatternSpec::Cross { args } => {
            let resolved: Vec<Vec<BranchShape>> = args
                .iter()
                .map(|arg| resolve(arg, ctx))
                .collect::<Result<_, _>>()?;

            if resolved.iter().any(|r| r.is_empty()) {
                return Ok(Vec::new());
            }

            // Row-major nesting: the rightmost argument varies fastest.
            let total: usize = resolved.iter().map(|r| r.len()).product();
            let mut counters = vec![0usize; resolved.len()];
            let mut branches = Vec::with_capacity(total);
            loop {
                let mut slices = Vec::new();
                for (arg, &i) in resolved.iter().zip(&counters) {
                    slices.extend(arg[i].slices.iter().cloned());
                }
                branches.push(BranchShape { slices });

                let mut pos = resolved.len();
                loop {
                    if pos == 0 {
                        return Ok(branches);
                    }
                    pos -= 1;
                    counters[pos] += 1;
                    if counters[pos] < resolved[pos].len() {
                        break;
                    }
                    counters[pos] = 0;
                }
            }
        }

        PatternSpec::Head { inner, n } => {
            let mut branches = resolve(inner, ctx)?;
            branches.truncate(*n);
            Ok(branches)
        }

        PatternSpec::Tail { inner, n } => {
            let branches = resolve(inner, ctx)?;
            let skip = branches.len().saturating_sub(*n);
            Ok(branches.into_iter().skip(skip).collect())
        }

        PatternSpec::Sample { inner, n, seed } => {
            let branches = resolve(inner, ctx)?;
            let amount = (*n).min(branches.len());

            let effective = crate::record::Fingerprint::of_parts([
                ctx.pattern_name.as_bytes(),
                &ctx.run_seed.to_le_bytes()[..],
                &seed.to_le_bytes()[..],
            ])
            .as_seed();
            let mut rng = StdRng::seed_from_u64(effective);
            let mut picked: Vec<usize> =
                rand::seq::index::sample(&mut rng, branches.len(), amount).into_vec();
            // Keep upstream creation order among the selected branches.
            picked.sort_unstable();

            Ok(picked
                .into_iter()
                .map(|i| branches[i].clone())
                .collect())
        }
    }
}

/// Compute the slice availability of an upstream value under the
/// upstream target's iteration mode.
pub fn arg_shape(
    target: &str,
    value: &Value,
    iteration: Iteration,
    group_by: Option<&str>,
) -> Result<ArgShape, PatternError> {
    let items = value
        .as_array()
        .ok_or_else(|| PatternError::NotSliceable {
            target: target.to_string(),
            reason: "value is not an array".to_string(),
        })?;

    match iteration {
        Iteration::Vector | Iteration::List => Ok(ArgShape::Len(items.len())),
        Iteration::Group => {
            let key = group_by.ok_or_else(|| PatternError::NotSliceable {
                target: target.to_string(),
                reason: "group iteration without a group_by key".to_string(),
            })?;
            // Group indices follow ascending key order, not source
            // element order.
            let mut keys = BTreeSet::new();
            for item in items {
                keys.insert(group_key_of(target, item, key)?);
            }
            Ok(ArgShape::Groups(keys.into_iter().collect()))
        }
    }
}

/// Extract one slice of an upstream value.
pub fn take_slice(
    target: &str,
    value: &Value,
    key: &SliceKey,
    group_by: Option<&str>,
) -> Result<Value, PatternError> {
    let items = value
        .as_array()
        .ok_or_else(|| PatternError::NotSliceable {
            target: target.to_string(),
            reason: "value is not an array".to_string(),
        })?;

    match key {
        SliceKey::Index(i) => items
            .get(*i)
            .cloned()
            .ok_or_else(|| PatternError::NotSliceable {
                target: target.to_string(),
                reason: format!("index {i} out of bounds ({} slices)", items.len()),
            }),
        SliceKey::Group(wanted) => {
            let field = group_by.ok_or_else(|| PatternError::NotSliceable {
                target: target.to_string(),
                reason: "group slice on a target without group_by".to_string(),
            })?;
            let mut group = Vec::new();
            for item in items {
                if group_key_of(target, item, field)? == *wanted {
                    group.push(item.clone());
                }
            }
            Ok(Value::Array(group))
        }
    }
}

fn group_key_of(target: &str, item: &Value, field: &str) -> Result<String, PatternError> {
    item.as_object()
        .and_then(|obj| obj.get(field))
        .map(Value::key_repr)
        .ok_or_else(|| PatternError::MissingGroupKey {
            target: target.to_string(),
            key: field.to_string(),
        })
}

/// Reassemble branch values (in ascending creation-index order) into
/// the pattern's whole value.
pub fn aggregate(iteration: Iteration, branch_values: Vec<Value>) -> Value {
    match iteration {
        // One entry per branch, no flattening.
        Iteration::List => Value::Array(branch_values),
        // Concatenate at the finest structural unit: array-valued
        // branches contribute their elements, scalar branches
        // contribute themselves. Group re-expansion is the same
        // concatenation in ascending group-index order.
        Iteration::Vector | Iteration::Group => {
            let mut out = Vec::new();
            for value in branch_values {
                match value {
                    Value::Array(items) => out.extend(items),
                    other => out.push(other),
                }
            }
            Value::Array(out)
        }
    }
}

/// Identity of one slice: derived from its source target, its
/// position or group key, and the content of the slice itself, so a
/// single changed upstream element invalidates only the branches that
/// consumed it.
pub fn slice_identity(source: &str, key: &SliceKey, slice_value: &Value) -> String {
    let digest = value_digest(slice_value);
    blake3::hash(format!("{source}\u{1}{key}\u{1}{digest}").as_bytes())
        .to_hex()
        .to_string()
}

/// Stable branch identity: the pattern name plus the ordered tuple of
/// slice identities the branch consumes.
pub fn branch_identity(pattern: &str, slice_ids: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(pattern.as_bytes());
    for id in slice_ids {
        hasher.update(&[1u8]);
        hasher.update(id.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Human-readable branch name: pattern name plus a short identity tag.
pub fn branch_unit_name(pattern: &str, identity: &str) -> String {
    format!("{pattern}#{}", &identity[..identity.len().min(12)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens(pairs: &[(&str, usize)]) -> HashMap<String, ArgShape> {
        pairs
            .iter()
            .map(|(n, l)| (n.to_string(), ArgShape::Len(*l)))
            .collect()
    }

    fn indices(shape: &BranchShape) -> Vec<(String, usize)> {
        shape
            .slices
            .iter()
            .map(|s| match s.key {
                SliceKey::Index(i) => (s.target.clone(), i),
                _ => panic!("expected index slice"),
            })
            .collect()
    }

    #[test]
    fn map_zips_equal_lengths() {
        let spec = PatternSpec::map(["a", "b"]);
        let branches = resolve_pattern_shape(&spec, &lens(&[("a", 3), ("b", 3)])).unwrap();
        assert_eq!(branches.len(), 3);
        for (i, branch) in branches.iter().enumerate() {
            assert_eq!(
                indices(branch),
                vec![("a".to_string(), i), ("b".to_string(), i)]
            );
        }
    }

    #[test]
    fn map_rejects_unequal_lengths() {
        let spec = PatternSpec::map(["a", "b"]);
        let err = resolve_pattern_shape(&spec, &lens(&[("a", 2), ("b", 3)])).unwrap_err();
        match err {
            PatternError::LengthMismatch { counts, .. } => {
                assert_eq!(
                    counts,
                    vec![("a".to_string(), 2), ("b".to_string(), 3)]
                );
            }
            other => panic!("expected LengthMismatch, got {other:?}"),
        }
    }

    #[test]
    fn cross_covers_all_pairs_rightmost_fastest() {
        let spec = PatternSpec::cross(["a", "b"]);
        let branches = resolve_pattern_shape(&spec, &lens(&[("a", 2), ("b", 2)])).unwrap();
        let got: Vec<_> = branches.iter().map(indices).collect();
        assert_eq!(
            got,
            vec![
                vec![("a".to_string(), 0), ("b".to_string(), 0)],
                vec![("a".to_string(), 0), ("b".to_string(), 1)],
                vec![("a".to_string(), 1), ("b".to_string(), 0)],
                vec![("a".to_string(), 1), ("b".to_string(), 1)],
            ]
        );
    }

    #[test]
    fn cross_treats_nested_map_as_composite_argument() {
        let spec = PatternSpec::cross([
            PatternSpec::leaf("w"),
            PatternSpec::map(["x", "y"]),
        ]);
        let branches =
            resolve_pattern_shape(&spec, &lens(&[("w", 2), ("x", 3), ("y", 3)])).unwrap();
        assert_eq!(branches.len(), 6);
        // First three branches hold w[0], inner map varying fastest.
        assert_eq!(
            indices(&branches[0]),
            vec![
                ("w".to_string(), 0),
                ("x".to_string(), 0),
                ("y".to_string(), 0)
            ]
        );
        assert_eq!(
            indices(&branches[2]),
            vec![
                ("w".to_string(), 0),
                ("x".to_string(), 2),
                ("y".to_string(), 2)
            ]
        );
        assert_eq!(
            indices(&branches[3]),
            vec![
                ("w".to_string(), 1),
                ("x".to_string(), 0),
                ("y".to_string(), 0)
            ]
        );
    }

    #[test]
    fn head_and_tail_restrict_by_creation_order() {
        let shapes = lens(&[("a", 5)]);

        let head = resolve_pattern_shape(&PatternSpec::head("a", 2), &shapes).unwrap();
        assert_eq!(
            head.iter().map(indices).collect::<Vec<_>>(),
            vec![
                vec![("a".to_string(), 0)],
                vec![("a".to_string(), 1)]
            ]
        );

        let tail = resolve_pattern_shape(&PatternSpec::tail("a", 2), &shapes).unwrap();
        assert_eq!(
            tail.iter().map(indices).collect::<Vec<_>>(),
            vec![
                vec![("a".to_string(), 3)],
                vec![("a".to_string(), 4)]
            ]
        );
    }

    #[test]
    fn head_larger_than_list_keeps_everything() {
        let branches =
            resolve_pattern_shape(&PatternSpec::head("a", 10), &lens(&[("a", 3)])).unwrap();
        assert_eq!(branches.len(), 3);
    }

    #[test]
    fn sample_is_reproducible_and_without_replacement() {
        let spec = PatternSpec::sample("a", 3, 7);
        let shapes = lens(&[("a", 10)]);

        let first = resolve_pattern_shape_seeded(&spec, &shapes, "p", 42).unwrap();
        let second = resolve_pattern_shape_seeded(&spec, &shapes, "p", 42).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);

        let mut picked: Vec<usize> = first
            .iter()
            .map(|b| match b.slices[0].key {
                SliceKey::Index(i) => i,
                _ => unreachable!(),
            })
            .collect();
        let unsorted = picked.clone();
        picked.sort_unstable();
        picked.dedup();
        assert_eq!(picked.len(), 3);
        // Selected branches keep upstream creation order.
        assert_eq!(unsorted, picked);
    }

    #[test]
    fn sample_varies_with_run_seed() {
        let spec = PatternSpec::sample("a", 3, 7);
        let shapes = lens(&[("a", 100)]);
        let a = resolve_pattern_shape_seeded(&spec, &shapes, "p", 1).unwrap();
        let b = resolve_pattern_shape_seeded(&spec, &shapes, "p", 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_leaf_is_rejected() {
        let err = resolve_pattern_shape(&PatternSpec::map(["ghost"]), &lens(&[])).unwrap_err();
        assert_eq!(err, PatternError::UnknownSymbol("ghost".to_string()));
    }

    #[test]
    fn group_shape_sorts_distinct_keys() {
        let rows = Value::Array(
            ["b", "a", "c", "a", "b", "a"]
                .iter()
                .map(|k| {
                    let mut obj = HashMap::new();
                    obj.insert("site".to_string(), Value::from(*k));
                    Value::Object(obj)
                })
                .collect(),
        );
        let shape = arg_shape("rows", &rows, Iteration::Group, Some("site")).unwrap();
        assert_eq!(
            shape,
            ArgShape::Groups(vec!["a".into(), "b".into(), "c".into()])
        );

        let a = take_slice("rows", &rows, &SliceKey::Group("a".into()), Some("site")).unwrap();
        assert_eq!(a.as_array().unwrap().len(), 3);
    }

    #[test]
    fn list_aggregation_keeps_one_entry_per_branch() {
        let agg = aggregate(
            Iteration::List,
            vec![Value::from(10i64), Value::from(20i64), Value::from(30i64)],
        );
        assert_eq!(
            agg,
            Value::Array(vec![
                Value::from(10i64),
                Value::from(20i64),
                Value::from(30i64)
            ])
        );
    }

    #[test]
    fn vector_aggregation_concatenates_at_finest_unit() {
        // Scalar branches behave like list aggregation.
        let scalars = aggregate(
            Iteration::Vector,
            vec![Value::from(10i64), Value::from(20i64), Value::from(30i64)],
        );
        assert_eq!(scalars.as_array().unwrap().len(), 3);

        // Structured branches contribute their elements, not themselves.
        let structured = aggregate(
            Iteration::Vector,
            vec![
                Value::Array(vec![Value::from(1i64), Value::from(2i64)]),
                Value::Array(vec![Value::from(3i64)]),
            ],
        );
        assert_eq!(structured.as_array().unwrap().len(), 3);
    }

    #[test]
    fn branch_identity_tracks_slice_content() {
        let a = slice_identity("up", &SliceKey::Index(0), &Value::from(1i64));
        let b = slice_identity("up", &SliceKey::Index(0), &Value::from(2i64));
        assert_ne!(a, b);

        let id1 = branch_identity("p", &[a.clone()]);
        let id2 = branch_identity("p", &[a.clone()]);
        let id3 = branch_identity("p", &[b]);
        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert_ne!(id1, branch_identity("q", &[a]));
    }

    #[test]
    fn leaves_are_deduplicated_in_order() {
        let spec = PatternSpec::cross([
            PatternSpec::leaf("w"),
            PatternSpec::map(["x", "w", "y"]),
        ]);
        assert_eq!(spec.leaves(), vec!["w", "x", "y"]);
    }
}
