//! Model serializer: saved model value to the viewer's shapes document

use crate::geometry::{BoundingBox, Geometry, PartStyle, Tessellate, Vec3};
use crate::{Error, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Shapes document format version understood by three-cad-viewer
pub const FORMAT_VERSION: u32 = 3;

/// A model ready to cross into the browser
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedModel {
    pub name: String,
    pub document: Value,
}

impl SerializedModel {
    /// Hex SHA-256 of the document. Equal geometry yields equal digests.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.document).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Number of leaf parts in the document
    pub fn part_count(&self) -> usize {
        fn count(node: &Value) -> usize {
            match node.get("parts").and_then(Value::as_array) {
                Some(parts) => parts.iter().map(count).sum(),
                None => 1,
            }
        }
        count(&self.document)
    }
}

/// Serialize `model` under `name`
pub fn serialize(name: &str, model: &Value) -> Result<SerializedModel> {
    let fail = |reason: String| Error::SerializationError { model: name.to_string(), reason };

    let geometry = Geometry::from_value(model).map_err(fail)?;
    let root = if matches!(geometry, Geometry::Part { .. }) {
        // A single part still gets a group around it
        Geometry::Compound { name: None, location: [0.0; 3], children: vec![geometry] }
    } else {
        geometry
    };

    let mut builder = DocumentBuilder::default();
    let document = builder.node(&root, name, "", [0.0; 3]).map_err(fail)?;

    if builder.triangles == 0 {
        return Err(fail("model has no triangles".to_string()));
    }
    log::debug!("serialized '{}': {} triangles, {} edge segments", name, builder.triangles, builder.segments);

    Ok(SerializedModel { name: name.to_string(), document })
}

#[derive(Default)]
struct DocumentBuilder {
    triangles: usize,
    segments: usize,
}

impl DocumentBuilder {
    fn node(&mut self, geometry: &Geometry, name: &str, parent_id: &str, offset: Vec3) -> std::result::Result<Value, String> {
        let id = format!("{}/{}", parent_id, name);
        match geometry {
            Geometry::Compound { location, children, .. } => {
                let offset = add(offset, *location);
                let mut seen: HashMap<String, usize> = HashMap::new();
                let mut parts = Vec::with_capacity(children.len());
                let mut bb: Option<BoundingBox> = None;
                for child in children {
                    let child_name = unique_name(&mut seen, &default_name(child));
                    let node = self.node(child, &child_name, &id, offset)?;
                    if let Some(child_bb) = node.get("bb").and_then(read_bb) {
                        bb = Some(bb.map_or(child_bb, |b| b.union(child_bb)));
                    }
                    parts.push(node);
                }

                Ok(json!({
                    "version": FORMAT_VERSION,
                    "name": name,
                    "id": id,
                    "loc": [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
                    "normal_len": 0,
                    "bb": bb,
                    "parts": parts,
                }))
            }
            Geometry::Part { style, location, shape, .. } => {
                self.leaf(&id, name, style, add(offset, *location), shape.as_ref())
            }
        }
    }

    fn leaf(&mut self, id: &str, name: &str, style: &PartStyle, offset: Vec3, shape: &dyn Tessellate) -> std::result::Result<Value, String> {
        let mut t = shape.tessellate()?;
        t.translate(offset);
        self.triangles += t.triangle_count();
        self.segments += t.edges.len();

        let bb = t.bounding_box();
        let flat = |points: &[Vec3]| points.iter().flatten().copied().collect::<Vec<f32>>();
        let edges: Vec<f32> = t.edges.iter().flatten().flatten().copied().collect();

        Ok(json!({
            "version": FORMAT_VERSION,
            "id": id,
            "name": name,
            "type": "shapes",
            "subtype": "solid",
            "shape": {
                "vertices": flat(&t.vertices),
                "normals": flat(&t.normals),
                "triangles": t.triangles,
                "edges": edges,
                "obj_vertices": [],
                "face_types": vec![0; t.triangles_per_face.len()],
                "edge_types": vec![0; t.segments_per_edge.len()],
                "triangles_per_face": t.triangles_per_face,
                "segments_per_edge": t.segments_per_edge,
            },
            "state": [1, 1],
            "color": style.color,
            "alpha": style.alpha,
            "texture": null,
            "loc": null,
            "renderback": false,
            "accuracy": null,
            "bb": bb,
        }))
    }
}

/// Name a child would get before sibling de-duplication
fn default_name(g: &Geometry) -> String {
    match g {
        Geometry::Compound { name, .. } => name.clone().unwrap_or_else(|| "Group".to_string()),
        Geometry::Part { name, shape, .. } => name.clone().unwrap_or_else(|| shape.kernel().to_string()),
    }
}

fn unique_name(seen: &mut HashMap<String, usize>, base: &str) -> String {
    let n = seen.entry(base.to_string()).or_insert(0);
    let name = if *n == 0 { base.to_string() } else { format!("{}_{}", base, n) };
    *n += 1;
    name
}

fn read_bb(v: &Value) -> Option<BoundingBox> {
    let f = |k: &str| v.get(k).and_then(Value::as_f64).map(|x| x as f32);
    Some(BoundingBox { xmin: f("xmin")?, xmax: f("xmax")?, ymin: f("ymin")?, ymax: f("ymax")?, zmin: f("zmin")?, zmax: f("zmax")? })
}

fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}
