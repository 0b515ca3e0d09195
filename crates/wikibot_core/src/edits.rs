use std::ops::Range;

use anyhow::{Result, bail};

/// One pending replacement of `range` (byte offsets into the original text).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub range: Range<usize>,
    pub replacement: String,
}

/// Edits recorded against one immutable snapshot of a page.
///
/// Every pass computes offsets against the same original text; [`EditPlan::apply`]
/// splices them in one go from the back of the text towards the front, so no
/// pass has to re-scan text another pass already mutated.
#[derive(Debug, Clone, Default)]
pub struct EditPlan {
    edits: Vec<TextEdit>,
}

impl EditPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, range: Range<usize>, replacement: impl Into<String>) {
        self.edits.push(TextEdit {
            range,
            replacement: replacement.into(),
        });
    }

    pub fn insert(&mut self, at: usize, text: impl Into<String>) {
        self.replace(at..at, text);
    }

    pub fn delete(&mut self, range: Range<usize>) {
        self.replace(range, String::new());
    }

    pub fn extend(&mut self, other: EditPlan) {
        self.edits.extend(other.edits);
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn edits(&self) -> &[TextEdit] {
        &self.edits
    }

    pub fn apply(&self, original: &str) -> Result<String> {
        let mut ordered: Vec<(usize, &TextEdit)> = self.edits.iter().enumerate().collect();
        // Insertions at the same offset keep their recording order in the output.
        ordered.sort_by(|(left_index, left), (right_index, right)| {
            right
                .range
                .start
                .cmp(&left.range.start)
                .then_with(|| right.range.end.cmp(&left.range.end))
                .then_with(|| right_index.cmp(left_index))
        });

        let mut output = original.to_string();
        let mut floor = original.len();
        for (_, edit) in ordered {
            let Range { start, end } = edit.range.clone();
            if start > end || end > original.len() {
                bail!(
                    "edit range {start}..{end} is outside text of {} bytes",
                    original.len()
                );
            }
            if !original.is_char_boundary(start) || !original.is_char_boundary(end) {
                bail!("edit range {start}..{end} splits a UTF-8 character");
            }
            if end > floor {
                bail!("edit range {start}..{end} overlaps another pending edit");
            }
            output.replace_range(start..end, &edit.replacement);
            floor = start;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::EditPlan;

    #[test]
    fn applies_edits_back_to_front_against_original_offsets() {
        let text = "alpha beta gamma";
        let mut plan = EditPlan::new();
        plan.replace(0..5, "ALPHA");
        plan.replace(11..16, "G");
        plan.insert(6, "[");
        plan.insert(10, "]");

        assert_eq!(plan.apply(text).expect("apply"), "ALPHA [beta] G");
    }

    #[test]
    fn insertions_at_same_offset_keep_recording_order() {
        let mut plan = EditPlan::new();
        plan.insert(3, "1");
        plan.insert(3, "2");
        assert_eq!(plan.apply("abcdef").expect("apply"), "abc12def");
    }

    #[test]
    fn overlapping_edits_are_rejected() {
        let mut plan = EditPlan::new();
        plan.replace(0..4, "x");
        plan.replace(2..6, "y");
        let error = plan.apply("abcdefgh").expect_err("must fail");
        assert!(error.to_string().contains("overlaps"));
    }

    #[test]
    fn out_of_range_edit_is_rejected() {
        let mut plan = EditPlan::new();
        plan.delete(2..40);
        assert!(plan.apply("short").is_err());
    }

    #[test]
    fn empty_plan_returns_original() {
        let plan = EditPlan::new();
        assert!(plan.is_empty());
        assert_eq!(plan.apply("same").expect("apply"), "same");
    }
}
