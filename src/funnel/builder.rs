//! Edits to a funnel's page tree.
//!
//! Blocks are addressed by id and placed into stacks by stack id. Every
//! block that enters the tree (insert, duplicate, copilot apply) gets fresh
//! ids for itself and its elements.

use std::collections::HashSet;

use serde_json::Value;

use super::models::{Block, Element, Funnel, Props, Stack, Step};
use crate::errors::BuilderError;

pub fn add_step(funnel: &mut Funnel, name: &str) -> String {
    let step = Step::new(name);
    let id = step.id.clone();
    funnel.steps.push(step);
    id
}

/// First id used more than once anywhere in a page tree.
///
/// Steps, frames, stacks, blocks and elements share one id space.
pub fn duplicate_id(steps: &[Step]) -> Option<String> {
    let mut seen = HashSet::new();
    for step in steps {
        let ids = std::iter::once(step.id.as_str())
            .chain(step.frames.iter().map(|f| f.id.as_str()))
            .chain(step.frames.iter().flat_map(|f| f.stacks.iter()).map(|s| s.id.as_str()))
            .chain(step.blocks().map(|b| b.id.as_str()))
            .chain(step.blocks().flat_map(|b| b.elements.iter()).map(|e| e.id.as_str()));
        for id in ids {
            if !seen.insert(id) {
                return Some(id.to_string());
            }
        }
    }
    None
}

fn stacks_mut(funnel: &mut Funnel) -> impl Iterator<Item = &mut Stack> {
    funnel
        .steps
        .iter_mut()
        .flat_map(|s| s.frames.iter_mut())
        .flat_map(|f| f.stacks.iter_mut())
}

fn find_stack_mut<'a>(funnel: &'a mut Funnel, stack_id: &str) -> Result<&'a mut Stack, BuilderError> {
    stacks_mut(funnel)
        .find(|s| s.id == stack_id)
        .ok_or_else(|| BuilderError::StackNotFound(stack_id.to_string()))
}

fn has_stack(funnel: &Funnel, stack_id: &str) -> bool {
    funnel
        .steps
        .iter()
        .flat_map(|s| s.frames.iter())
        .flat_map(|f| f.stacks.iter())
        .any(|s| s.id == stack_id)
}

/// Stack id and index of a block.
fn locate_block(funnel: &Funnel, block_id: &str) -> Option<(String, usize)> {
    funnel
        .steps
        .iter()
        .flat_map(|s| s.frames.iter())
        .flat_map(|f| f.stacks.iter())
        .find_map(|stack| {
            stack
                .blocks
                .iter()
                .position(|b| b.id == block_id)
                .map(|idx| (stack.id.clone(), idx))
        })
}

pub fn find_block<'a>(funnel: &'a Funnel, block_id: &str) -> Option<&'a Block> {
    funnel
        .steps
        .iter()
        .flat_map(|s| s.blocks())
        .find(|b| b.id == block_id)
}

/// First stack of the given step, or of the first step when none is given.
pub fn default_stack_id(funnel: &Funnel, step_id: Option<&str>) -> Result<String, BuilderError> {
    let step = match step_id {
        Some(id) => funnel
            .steps
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| BuilderError::StepNotFound(id.to_string()))?,
        None => funnel.steps.first().ok_or(BuilderError::EmptyFunnel)?,
    };
    step.frames
        .iter()
        .flat_map(|f| f.stacks.iter())
        .map(|s| s.id.clone())
        .next()
        .ok_or(BuilderError::EmptyFunnel)
}

/// Insert a block into a stack at `index` (clamped; `None` appends).
/// Returns the new block id.
pub fn insert_block(
    funnel: &mut Funnel,
    stack_id: &str,
    index: Option<usize>,
    mut block: Block,
) -> Result<String, BuilderError> {
    let stack = find_stack_mut(funnel, stack_id)?;
    block.reissue_ids();
    let id = block.id.clone();
    let at = index.unwrap_or(stack.blocks.len()).min(stack.blocks.len());
    stack.blocks.insert(at, block);
    Ok(id)
}

/// Drag-and-drop move. `index` is the position in the target stack after the
/// block has been taken out of its current place.
pub fn move_block(
    funnel: &mut Funnel,
    block_id: &str,
    to_stack_id: &str,
    index: usize,
) -> Result<(), BuilderError> {
    if !has_stack(funnel, to_stack_id) {
        return Err(BuilderError::StackNotFound(to_stack_id.to_string()));
    }
    let block = remove_block(funnel, block_id)?;
    let stack = find_stack_mut(funnel, to_stack_id)?;
    let at = index.min(stack.blocks.len());
    stack.blocks.insert(at, block);
    Ok(())
}

pub fn remove_block(funnel: &mut Funnel, block_id: &str) -> Result<Block, BuilderError> {
    let (stack_id, idx) = locate_block(funnel, block_id)
        .ok_or_else(|| BuilderError::BlockNotFound(block_id.to_string()))?;
    let stack = find_stack_mut(funnel, &stack_id)?;
    Ok(stack.blocks.remove(idx))
}

/// Copy a block (with fresh ids) directly after the original.
pub fn duplicate_block(funnel: &mut Funnel, block_id: &str) -> Result<String, BuilderError> {
    let (stack_id, idx) = locate_block(funnel, block_id)
        .ok_or_else(|| BuilderError::BlockNotFound(block_id.to_string()))?;
    let stack = find_stack_mut(funnel, &stack_id)?;
    let mut copy = stack.blocks[idx].clone();
    copy.reissue_ids();
    let id = copy.id.clone();
    stack.blocks.insert(idx + 1, copy);
    Ok(id)
}

/// Merge a patch into a props map. `null` values remove the key.
pub fn merge_props(props: &mut Props, patch: &Props) {
    for (key, value) in patch {
        if value.is_null() {
            props.remove(key);
        } else {
            props.insert(key.clone(), value.clone());
        }
    }
}

/// Toolbar edit on a single element.
pub fn update_element_props(
    funnel: &mut Funnel,
    element_id: &str,
    patch: &Props,
) -> Result<Element, BuilderError> {
    let element = stacks_mut(funnel)
        .flat_map(|s| s.blocks.iter_mut())
        .flat_map(|b| b.elements.iter_mut())
        .find(|e| e.id == element_id)
        .ok_or_else(|| BuilderError::ElementNotFound(element_id.to_string()))?;
    merge_props(&mut element.props, patch);
    Ok(element.clone())
}

pub fn update_block_props(
    funnel: &mut Funnel,
    block_id: &str,
    patch: &Props,
) -> Result<Block, BuilderError> {
    let block = stacks_mut(funnel)
        .flat_map(|s| s.blocks.iter_mut())
        .find(|b| b.id == block_id)
        .ok_or_else(|| BuilderError::BlockNotFound(block_id.to_string()))?;
    merge_props(&mut block.props, patch);
    Ok(block.clone())
}

pub fn apply_settings_patch(
    funnel: &mut Funnel,
    step_id: &str,
    patch: &Props,
) -> Result<Props, BuilderError> {
    let step = funnel
        .steps
        .iter_mut()
        .find(|s| s.id == step_id)
        .ok_or_else(|| BuilderError::StepNotFound(step_id.to_string()))?;
    merge_props(&mut step.settings, patch);
    Ok(step.settings.clone())
}

/// Convenience for patches built in code.
pub fn props(pairs: &[(&str, Value)]) -> Props {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn funnel() -> Funnel {
        Funnel {
            id: 1,
            name: "Webinar".into(),
            steps: vec![Step::new("Opt-in"), Step::new("Thanks")],
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn stack_id(funnel: &Funnel, step: usize) -> String {
        funnel.steps[step].frames[0].stacks[0].id.clone()
    }

    fn block_ids(funnel: &Funnel, step: usize) -> Vec<String> {
        funnel.steps[step].blocks().map(|b| b.id.clone()).collect()
    }

    #[test]
    fn test_duplicate_id_across_steps() {
        let mut f = funnel();
        assert_eq!(duplicate_id(&f.steps), None);

        let shared = stack_id(&f, 0);
        f.steps[1].frames[0].stacks[0].id = shared.clone();
        assert_eq!(duplicate_id(&f.steps), Some(shared));

        let mut f = funnel();
        let block = Block::new("hero");
        let id = block.id.clone();
        f.steps[0].frames[0].stacks[0].blocks.push(block.clone());
        f.steps[1].frames[0].stacks[0].blocks.push(block);
        assert_eq!(duplicate_id(&f.steps), Some(id));
    }

    #[test]
    fn test_insert_block_reissues_ids_and_clamps_index() {
        let mut f = funnel();
        let stack = stack_id(&f, 0);
        let template = Block::new("hero").with_element(Element::new("headline"));
        let template_id = template.id.clone();

        let first = insert_block(&mut f, &stack, Some(10), template.clone()).unwrap();
        let second = insert_block(&mut f, &stack, Some(0), template).unwrap();

        assert_ne!(first, template_id);
        assert_ne!(first, second);
        assert_eq!(block_ids(&f, 0), vec![second, first]);
        let elements: Vec<&str> = f.steps[0]
            .blocks()
            .map(|b| b.elements[0].id.as_str())
            .collect();
        assert_ne!(elements[0], elements[1]);
    }

    #[test]
    fn test_insert_into_unknown_stack() {
        let mut f = funnel();
        let err = insert_block(&mut f, "nope", None, Block::new("cta")).unwrap_err();
        assert_eq!(err, BuilderError::StackNotFound("nope".into()));
    }

    #[test]
    fn test_move_block_between_stacks() {
        let mut f = funnel();
        let (s0, s1) = (stack_id(&f, 0), stack_id(&f, 1));
        let a = insert_block(&mut f, &s0, None, Block::new("a")).unwrap();
        let b = insert_block(&mut f, &s0, None, Block::new("b")).unwrap();
        let c = insert_block(&mut f, &s1, None, Block::new("c")).unwrap();

        move_block(&mut f, &a, &s1, 0).unwrap();
        assert_eq!(block_ids(&f, 0), vec![b.clone()]);
        assert_eq!(block_ids(&f, 1), vec![a.clone(), c.clone()]);

        // Reorder within one stack
        move_block(&mut f, &a, &s1, 5).unwrap();
        assert_eq!(block_ids(&f, 1), vec![c, a]);
    }

    #[test]
    fn test_move_to_unknown_stack_leaves_tree_intact() {
        let mut f = funnel();
        let s0 = stack_id(&f, 0);
        let a = insert_block(&mut f, &s0, None, Block::new("a")).unwrap();
        let err = move_block(&mut f, &a, "missing", 0).unwrap_err();
        assert_eq!(err, BuilderError::StackNotFound("missing".into()));
        assert_eq!(block_ids(&f, 0), vec![a]);
    }

    #[test]
    fn test_remove_and_duplicate_block() {
        let mut f = funnel();
        let s0 = stack_id(&f, 0);
        let a = insert_block(&mut f, &s0, None, Block::new("a").with_prop("title", json!("Hi"))).unwrap();
        let b = insert_block(&mut f, &s0, None, Block::new("b")).unwrap();

        let copy = duplicate_block(&mut f, &a).unwrap();
        assert_eq!(block_ids(&f, 0), vec![a.clone(), copy.clone(), b.clone()]);
        assert_eq!(find_block(&f, &copy).unwrap().props["title"], "Hi");

        let removed = remove_block(&mut f, &a).unwrap();
        assert_eq!(removed.kind, "a");
        assert_eq!(
            remove_block(&mut f, &a).unwrap_err(),
            BuilderError::BlockNotFound(a)
        );
    }

    #[test]
    fn test_element_patch_merges_and_removes_keys() {
        let mut f = funnel();
        let s0 = stack_id(&f, 0);
        let button = Element::new("button")
            .with_prop("label", json!("Buy"))
            .with_prop("color", json!("#000"));
        let block_id = insert_block(&mut f, &s0, None, Block::new("cta").with_element(button)).unwrap();
        let element_id = find_block(&f, &block_id).unwrap().elements[0].id.clone();

        let updated = update_element_props(
            &mut f,
            &element_id,
            &props(&[("color", json!("#f00")), ("label", Value::Null), ("bold", json!(true))]),
        )
        .unwrap();
        assert_eq!(updated.props.get("color"), Some(&json!("#f00")));
        assert!(!updated.props.contains_key("label"));
        assert_eq!(updated.props.get("bold"), Some(&json!(true)));

        assert!(matches!(
            update_element_props(&mut f, "ghost", &Props::new()),
            Err(BuilderError::ElementNotFound(_))
        ));
    }

    #[test]
    fn test_settings_patch() {
        let mut f = funnel();
        let step_id = f.steps[1].id.clone();
        let settings = apply_settings_patch(
            &mut f,
            &step_id,
            &props(&[("font", json!("Inter")), ("background", json!("#fff"))]),
        )
        .unwrap();
        assert_eq!(settings.len(), 2);
        assert!(f.steps[0].settings.is_empty());
        assert!(matches!(
            apply_settings_patch(&mut f, "none", &Props::new()),
            Err(BuilderError::StepNotFound(_))
        ));
    }

    #[test]
    fn test_default_stack_id() {
        let mut f = funnel();
        assert_eq!(default_stack_id(&f, None).unwrap(), stack_id(&f, 0));
        let thanks = f.steps[1].id.clone();
        assert_eq!(default_stack_id(&f, Some(&thanks)).unwrap(), stack_id(&f, 1));
        f.steps.clear();
        assert_eq!(default_stack_id(&f, None).unwrap_err(), BuilderError::EmptyFunnel);
    }

    #[test]
    fn test_add_step() {
        let mut f = funnel();
        let id = add_step(&mut f, "Upsell Offer");
        assert_eq!(f.steps.len(), 3);
        assert_eq!(f.steps[2].id, id);
        assert_eq!(f.steps[2].slug, "upsell-offer");
    }
}
