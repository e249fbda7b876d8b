//! Funnel page tree: steps → frames → stacks → blocks → elements.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Props = Map<String, Value>;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Funnel {
    pub id: i64,
    pub name: String,
    pub steps: Vec<Step>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub settings: Props,
    #[serde(default)]
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub props: Props,
    #[serde(default)]
    pub stacks: Vec<Stack>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stack {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub props: Props,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub props: Props,
    #[serde(default)]
    pub elements: Vec<Element>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Element {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub props: Props,
}

impl Block {
    pub fn new(kind: &str) -> Self {
        Self {
            id: new_id(),
            kind: kind.to_string(),
            props: Props::new(),
            elements: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn with_prop(mut self, key: &str, value: Value) -> Self {
        self.props.insert(key.to_string(), value);
        self
    }

    /// Give the block and every element fresh ids, for pasting a copy.
    pub fn reissue_ids(&mut self) {
        self.id = new_id();
        for element in &mut self.elements {
            element.id = new_id();
        }
    }
}

impl Element {
    pub fn new(kind: &str) -> Self {
        Self {
            id: new_id(),
            kind: kind.to_string(),
            props: Props::new(),
        }
    }

    pub fn with_prop(mut self, key: &str, value: Value) -> Self {
        self.props.insert(key.to_string(), value);
        self
    }
}

impl Step {
    /// A step with one frame holding one empty stack.
    pub fn new(name: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            slug: slugify(name),
            settings: Props::new(),
            frames: vec![Frame {
                id: new_id(),
                props: Props::new(),
                stacks: vec![Stack {
                    id: new_id(),
                    props: Props::new(),
                    blocks: Vec::new(),
                }],
            }],
        }
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.frames
            .iter()
            .flat_map(|f| f.stacks.iter())
            .flat_map(|s| s.blocks.iter())
    }
}

/// Lowercase, ASCII alphanumerics kept, runs of anything else collapsed to `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}
