use log::trace;
use rand::Rng;

use crate::corpus::Corpus;
use crate::state::{JsType, SyntaxClass};
use crate::testcase::Testcase;

/// Element values written by the array-store mutator.
const ARRAY_STORE_VALUES: &[&str] = &["0", "1", "-1", "1e9", "NaN", "null", "{}", "'r'"];

/// Numeric arguments fed to synthesized calls when no typed variable is
/// in scope at the target line.
const FALLBACK_ARGS: &[&str] = &["0", "1", "13", "4096", "-1"];

/// Probability that the line-removal mutator takes two lines instead of one.
const REMOVE_TWO_LINES_PROBABILITY: f64 = 0.25;

/// What a mutation attempt did to the testcase.
///
/// `NoTarget` means the strategy found nothing legal to edit (no array
/// variable for an array mutation, no insertable line of a usable class)
/// and left the testcase untouched, so the caller can fall back to a
/// different strategy within the same iteration. It is distinct from an
/// applied-but-ineffective edit, which still reports `Applied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    NoTarget,
}

/// One mutation strategy over a testcase.
///
/// Every implementation picks its target from the state's insertable-line
/// classification, renders the edit in that line's syntax class, and
/// updates the state through the structural edit operations; a mutated
/// testcase is never re-probed on this path.
pub trait Mutator<R: Rng> {
    fn name(&self) -> &'static str;
    fn mutate(
        &mut self,
        testcase: &mut Testcase,
        rng: &mut R,
        corpus: Option<&Corpus>,
    ) -> Result<MutationOutcome, anyhow::Error>;
}

/// Render an expression for a given insertion-point syntax class.
fn render_for_class(expression: &str, class: SyntaxClass) -> Option<String> {
    match class {
        SyntaxClass::Statement => Some(format!("{expression};")),
        SyntaxClass::TrailingComma => Some(format!("{expression},")),
        SyntaxClass::LeadingComma => Some(format!(",{expression}")),
        SyntaxClass::NotInsertable => None,
    }
}

/// Uniform pick from a slice.
fn choose<'a, T, R: Rng>(items: &'a [T], rng: &mut R) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    items.get(rng.random_range(0..items.len()))
}

/// Insertion positions worth targeting: any class, but skip positions the
/// probe saw time out.
fn candidate_positions(testcase: &Testcase) -> Vec<usize> {
    testcase
        .state
        .insertable_lines()
        .into_iter()
        .filter(|at| !testcase.state.timeout_prone_lines.contains(at))
        .collect()
}

/// Variables with a type observation at or before `line`, most recent
/// observation wins.
fn live_variables_at(testcase: &Testcase, line: usize) -> Vec<(String, JsType)> {
    testcase
        .state
        .variable_types
        .iter()
        .filter_map(|(name, observations)| {
            observations
                .iter()
                .rev()
                .find(|(l, _)| *l <= line)
                .map(|(_, ty)| (name.clone(), *ty))
        })
        .collect()
}

/// Calls a known function at an insertable line, with arguments drawn
/// from variables live at that line, padded with numeric fallbacks up to
/// the probed arity.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallFunctionMutator;

impl<R: Rng> Mutator<R> for CallFunctionMutator {
    fn name(&self) -> &'static str {
        "call_function"
    }

    fn mutate(
        &mut self,
        testcase: &mut Testcase,
        rng: &mut R,
        _corpus: Option<&Corpus>,
    ) -> Result<MutationOutcome, anyhow::Error> {
        let functions: Vec<(String, usize)> = testcase
            .state
            .function_arities
            .iter()
            .map(|(name, arity)| (name.clone(), *arity))
            .collect();
        let positions = candidate_positions(testcase);
        let (Some((name, arity)), Some(&at)) =
            (choose(&functions, rng).cloned(), choose(&positions, rng))
        else {
            return Ok(MutationOutcome::NoTarget);
        };

        let live = live_variables_at(testcase, at);
        let mut args: Vec<String> = Vec::with_capacity(arity);
        for _ in 0..arity {
            let arg = match choose(&live, rng) {
                Some((var, _)) if rng.random_bool(0.5) => var.clone(),
                _ => choose(FALLBACK_ARGS, rng)
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
            };
            args.push(arg);
        }
        let expression = format!("{name}({})", args.join(", "));
        let Some(text) = render_for_class(&expression, testcase.state.class_of(at)) else {
            return Ok(MutationOutcome::NoTarget);
        };
        trace!("call_function inserts {text:?} at line {at}");
        testcase.insert_line(at, &text);
        Ok(MutationOutcome::Applied)
    }
}

/// Stores a value into a known array variable at an index near one of its
/// observed lengths. Signals `NoTarget` when the program has no probed
/// array at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayStoreMutator;

impl<R: Rng> Mutator<R> for ArrayStoreMutator {
    fn name(&self) -> &'static str {
        "array_store"
    }

    fn mutate(
        &mut self,
        testcase: &mut Testcase,
        rng: &mut R,
        _corpus: Option<&Corpus>,
    ) -> Result<MutationOutcome, anyhow::Error> {
        // Arrays with their observation lines and the largest length seen.
        let arrays: Vec<(String, usize, u64)> = testcase
            .state
            .array_lengths
            .iter()
            .flat_map(|(name, observations)| {
                observations.iter().filter_map(|(line, lengths)| {
                    lengths.iter().max().map(|&len| (name.clone(), *line, len))
                })
            })
            .collect();
        let Some((name, observed_line, len)) = choose(&arrays, rng).cloned() else {
            return Ok(MutationOutcome::NoTarget);
        };

        // Insert at or after the line the length was observed on, so the
        // array exists when the store runs.
        let positions: Vec<usize> = candidate_positions(testcase)
            .into_iter()
            .filter(|&at| at >= observed_line)
            .collect();
        let Some(&at) = choose(&positions, rng) else {
            return Ok(MutationOutcome::NoTarget);
        };

        // In bounds, at the boundary, or just past it.
        let index = match rng.random_range(0..3u8) {
            0 if len > 0 => rng.random_range(0..len),
            1 => len,
            _ => len + rng.random_range(1..=16u64),
        };
        let value = choose(ARRAY_STORE_VALUES, rng).copied().unwrap_or("0");
        let expression = format!("{name}[{index}] = {value}");
        let Some(text) = render_for_class(&expression, testcase.state.class_of(at)) else {
            return Ok(MutationOutcome::NoTarget);
        };
        trace!("array_store inserts {text:?} at line {at}");
        testcase.insert_line(at, &text);
        Ok(MutationOutcome::Applied)
    }
}

/// Duplicates one existing line at a statement-insertable position.
/// Brace-bearing lines are never sources; replaying half a block would
/// unbalance the program.
#[derive(Debug, Default, Clone, Copy)]
pub struct DuplicateLineMutator;

impl<R: Rng> Mutator<R> for DuplicateLineMutator {
    fn name(&self) -> &'static str {
        "duplicate_line"
    }

    fn mutate(
        &mut self,
        testcase: &mut Testcase,
        rng: &mut R,
        _corpus: Option<&Corpus>,
    ) -> Result<MutationOutcome, anyhow::Error> {
        let sources: Vec<usize> = (0..testcase.line_count())
            .filter(|&idx| {
                let line = testcase.line(idx).unwrap_or_default().trim();
                !line.is_empty() && !line.contains('{') && !line.contains('}')
            })
            .collect();
        let targets: Vec<usize> = testcase.state.statement_lines.clone();
        let (Some(&source), Some(&at)) = (choose(&sources, rng), choose(&targets, rng)) else {
            return Ok(MutationOutcome::NoTarget);
        };
        let text = testcase.line(source).unwrap_or_default().to_string();
        trace!("duplicate_line copies line {source} to {at}");
        testcase.insert_line(at, &text);
        Ok(MutationOutcome::Applied)
    }
}

/// Removes a short run of lines, steering clear of brace structure so the
/// program stays balanced.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveLinesMutator;

impl<R: Rng> Mutator<R> for RemoveLinesMutator {
    fn name(&self) -> &'static str {
        "remove_lines"
    }

    fn mutate(
        &mut self,
        testcase: &mut Testcase,
        rng: &mut R,
        _corpus: Option<&Corpus>,
    ) -> Result<MutationOutcome, anyhow::Error> {
        if testcase.line_count() < 2 {
            return Ok(MutationOutcome::NoTarget);
        }
        let removable: Vec<usize> = (0..testcase.line_count())
            .filter(|&idx| {
                let line = testcase.line(idx).unwrap_or_default();
                !line.contains('{') && !line.contains('}')
            })
            .collect();
        let Some(&start) = choose(&removable, rng) else {
            return Ok(MutationOutcome::NoTarget);
        };
        let mut count = 1;
        if rng.random_bool(REMOVE_TWO_LINES_PROBABILITY)
            && removable.contains(&(start + 1))
            && start + 1 < testcase.line_count()
        {
            count = 2;
        }
        trace!("remove_lines drops {count} line(s) at {start}");
        testcase.remove_lines(start, count);
        Ok(MutationOutcome::Applied)
    }
}

/// Splices a random corpus entry into the testcase at a statement
/// position, carrying the donor's state along through `merge_at`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpliceMutator;

impl<R: Rng> Mutator<R> for SpliceMutator {
    fn name(&self) -> &'static str {
        "splice"
    }

    fn mutate(
        &mut self,
        testcase: &mut Testcase,
        rng: &mut R,
        corpus: Option<&Corpus>,
    ) -> Result<MutationOutcome, anyhow::Error> {
        let Some(corpus) = corpus else {
            return Ok(MutationOutcome::NoTarget);
        };
        let Some(donor) = corpus.random_select(rng) else {
            return Ok(MutationOutcome::NoTarget);
        };
        let targets: Vec<usize> = testcase.state.statement_lines.clone();
        let Some(&at) = choose(&targets, rng) else {
            return Ok(MutationOutcome::NoTarget);
        };
        trace!(
            "splice merges corpus entry {} in at line {at}",
            donor.source_name()
        );
        let donor_testcase = donor.testcase.clone();
        testcase.merge_at(at, &donor_testcase);
        Ok(MutationOutcome::Applied)
    }
}

/// Merge two programs into one: `b` is spliced into `a` at a random
/// statement-insertable point of `a` (appended when `a` has none), with
/// both states combined.
pub fn merge<R: Rng>(a: &Testcase, b: &Testcase, rng: &mut R) -> Testcase {
    let mut merged = a.clone();
    let point = match choose(&merged.state.statement_lines.clone(), rng) {
        Some(&at) => at,
        None => merged.line_count(),
    };
    merged.merge_at(point, b);
    merged
}

/// The standard strategy set, in the order the fallback walk tries them.
pub fn default_mutators<R: Rng>() -> Vec<Box<dyn Mutator<R>>> {
    vec![
        Box::new(CallFunctionMutator),
        Box::new(ArrayStoreMutator),
        Box::new(SpliceMutator),
        Box::new(DuplicateLineMutator),
        Box::new(RemoveLinesMutator),
    ]
}

/// Apply one mutation: start at a random strategy and walk the list until
/// one reports `Applied`. Returns the name of the strategy that applied,
/// or `None` when every strategy found no target.
pub fn apply_random_mutation<R: Rng>(
    mutators: &mut [Box<dyn Mutator<R>>],
    testcase: &mut Testcase,
    rng: &mut R,
    corpus: Option<&Corpus>,
) -> Result<Option<&'static str>, anyhow::Error> {
    if mutators.is_empty() {
        return Ok(None);
    }
    let start = rng.random_range(0..mutators.len());
    for offset in 0..mutators.len() {
        let mutator = &mut mutators[(start + offset) % mutators.len()];
        if mutator.mutate(testcase, rng, corpus)? == MutationOutcome::Applied {
            return Ok(Some(mutator.name()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FuzzerContext, RiffleConfig};
    use crate::state::SyntaxClass;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0xdecaf)
    }

    /// A probed-looking testcase: statement-insertable everywhere, one
    /// typed variable, one array, one function.
    fn rich_testcase() -> Testcase {
        let mut tc =
            Testcase::from_text("var v0 = 1;\nvar v1 = [1,2,3];\nfunction f0(a) {}\nf0(v0);");
        for at in 0..=tc.line_count() {
            tc.state.mark_line(at, SyntaxClass::Statement);
        }
        tc.state
            .variable_types
            .insert("v0".to_string(), vec![(1, JsType::RealNumber)]);
        tc.state
            .variable_types
            .insert("v1".to_string(), vec![(2, JsType::Array)]);
        tc.state
            .array_lengths
            .insert("v1".to_string(), vec![(2, vec![3])]);
        tc.state.function_arities.insert("f0".to_string(), 1);
        tc
    }

    #[test]
    fn test_render_for_class_forms() {
        assert_eq!(
            render_for_class("f()", SyntaxClass::Statement),
            Some("f();".to_string())
        );
        assert_eq!(
            render_for_class("f()", SyntaxClass::TrailingComma),
            Some("f(),".to_string())
        );
        assert_eq!(
            render_for_class("f()", SyntaxClass::LeadingComma),
            Some(",f()".to_string())
        );
        assert_eq!(render_for_class("f()", SyntaxClass::NotInsertable), None);
    }

    #[test]
    fn test_call_function_mutator_inserts_consistent_edit() {
        let mut tc = rich_testcase();
        let before = tc.line_count();
        let mut rng = rng();
        let outcome = CallFunctionMutator.mutate(&mut tc, &mut rng, None).unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert_eq!(tc.line_count(), before + 1);
        assert!(tc.is_consistent());
        assert!(tc.text().contains("f0("));
    }

    #[test]
    fn test_call_function_mutator_no_functions_is_no_target() {
        let mut tc = Testcase::from_text("a();");
        tc.state.mark_line(0, SyntaxClass::Statement);
        let mut rng = rng();
        let outcome = CallFunctionMutator.mutate(&mut tc, &mut rng, None).unwrap();
        assert_eq!(outcome, MutationOutcome::NoTarget);
        assert_eq!(tc.text(), "a();");
    }

    #[test]
    fn test_array_store_mutator_targets_known_array() {
        let mut tc = rich_testcase();
        let mut rng = rng();
        let outcome = ArrayStoreMutator.mutate(&mut tc, &mut rng, None).unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert!(tc.is_consistent());
        assert!(tc.text().contains("v1["));
    }

    #[test]
    fn test_array_store_mutator_without_arrays_is_no_target() {
        let mut tc = Testcase::from_text("var v0 = 1;");
        tc.state.mark_line(0, SyntaxClass::Statement);
        tc.state.mark_line(1, SyntaxClass::Statement);
        let mut rng = rng();
        let outcome = ArrayStoreMutator.mutate(&mut tc, &mut rng, None).unwrap();
        assert_eq!(outcome, MutationOutcome::NoTarget);
    }

    #[test]
    fn test_comma_class_lines_get_comma_rendering() {
        let mut tc = Testcase::from_text("g(\n1\n);");
        tc.state.mark_line(1, SyntaxClass::TrailingComma);
        tc.state.function_arities.insert("h".to_string(), 0);
        let mut rng = rng();
        let outcome = CallFunctionMutator.mutate(&mut tc, &mut rng, None).unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert!(tc.lines().iter().any(|l| l == "h(),"));
    }

    #[test]
    fn test_duplicate_line_mutator_skips_brace_lines() {
        let mut tc = Testcase::from_text("function f() {\nreturn 1;\n}");
        tc.state.mark_line(1, SyntaxClass::Statement);
        let mut rng = rng();
        let outcome = DuplicateLineMutator
            .mutate(&mut tc, &mut rng, None)
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        // Only the return line was eligible as a source.
        assert_eq!(
            tc.lines()
                .iter()
                .filter(|l| l.contains("return 1;"))
                .count(),
            2
        );
        assert!(tc.is_consistent());
    }

    #[test]
    fn test_remove_lines_mutator_keeps_consistency() {
        let mut tc = rich_testcase();
        let before = tc.line_count();
        let mut rng = rng();
        let outcome = RemoveLinesMutator.mutate(&mut tc, &mut rng, None).unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert!(tc.line_count() < before);
        assert!(tc.is_consistent());
    }

    #[test]
    fn test_splice_mutator_needs_corpus() {
        let mut tc = rich_testcase();
        let mut rng = rng();
        let outcome = SpliceMutator.mutate(&mut tc, &mut rng, None).unwrap();
        assert_eq!(outcome, MutationOutcome::NoTarget);
    }

    #[test]
    fn test_splice_mutator_pulls_from_corpus() {
        let dir = tempdir().unwrap();
        let ctx = FuzzerContext::new(RiffleConfig::default(), dir.path().to_path_buf());
        ctx.ensure_layout().unwrap();
        let mut corpus = Corpus::open(&ctx).unwrap();
        let mut donor = Testcase::from_text("donor();");
        for at in 0..=donor.line_count() {
            donor.state.mark_line(at, SyntaxClass::Statement);
        }
        donor.state.expected_runtime_ms = 1;
        corpus.add(donor, vec![1]).unwrap();

        let mut tc = rich_testcase();
        let mut rng = rng();
        let outcome = SpliceMutator
            .mutate(&mut tc, &mut rng, Some(&corpus))
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert!(tc.text().contains("donor();"));
        assert!(tc.is_consistent());
    }

    #[test]
    fn test_merge_combines_text_and_state() {
        let a = rich_testcase();
        let mut b = Testcase::from_text("extra();");
        b.state.mark_line(0, SyntaxClass::Statement);
        let mut rng = rng();
        let merged = merge(&a, &b, &mut rng);
        assert_eq!(merged.line_count(), a.line_count() + b.line_count());
        assert!(merged.text().contains("extra();"));
        assert!(merged.is_consistent());
        // The inputs are untouched; merge works on owned copies.
        assert_eq!(a.line_count(), 4);
    }

    #[test]
    fn test_apply_random_mutation_falls_back_until_applied() {
        // Only statement lines and nothing else probed: the array and
        // function strategies report NoTarget and the walk falls through
        // to one that applies.
        let mut tc = Testcase::from_text("a();\nb();");
        for at in 0..=tc.line_count() {
            tc.state.mark_line(at, SyntaxClass::Statement);
        }
        let mut rng = rng();
        let mut mutators = default_mutators::<ChaCha8Rng>();
        let applied = apply_random_mutation(&mut mutators, &mut tc, &mut rng, None).unwrap();
        assert!(applied.is_some());
        assert!(tc.is_consistent());
    }

    #[test]
    fn test_apply_random_mutation_reports_none_when_nothing_legal() {
        // No insertable line anywhere and a single line: every strategy
        // is out of targets.
        let mut tc = Testcase::from_text("{");
        let mut rng = rng();
        let mut mutators = default_mutators::<ChaCha8Rng>();
        let applied = apply_random_mutation(&mut mutators, &mut tc, &mut rng, None).unwrap();
        assert_eq!(applied, None);
        assert_eq!(tc.text(), "{");
    }
}
