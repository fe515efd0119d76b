//! Geometry kernels the serializer understands.
//!
//! A saved model is a JSON value copied out of the example script. It is
//! recognised by capability rather than by type: anything that can be turned
//! into a [`Tessellation`] is exportable. Two kernels are supported:
//!
//! - mesh objects carrying explicit `vertices` / `triangles` (optionally
//!   `normals` and `edges`)
//! - parametric solids: `{ solid: "box" | "cylinder" | "sphere", ... }`
//!
//! Arrays and `{ parts: [...] }` objects group either kind into compounds.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::f32::consts::PI;

pub type Vec3 = [f32; 3];

/// Color used when a part does not set one
pub const DEFAULT_COLOR: &str = "#e8b024";

/// Default number of segments around round primitives
pub const DEFAULT_SEGMENTS: u32 = 32;

/// Dihedral angle above which a shared mesh edge is drawn
const FEATURE_ANGLE_DEG: f32 = 30.0;

/// Triangulated surface plus edge polylines of one part
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tessellation {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub triangles: Vec<u32>,
    pub triangles_per_face: Vec<u32>,
    pub edges: Vec<[Vec3; 2]>,
    pub segments_per_edge: Vec<u32>,
}

/// Axis-aligned bounds in the viewer's `bb` layout
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub xmax: f32,
    pub ymin: f32,
    pub ymax: f32,
    pub zmin: f32,
    pub zmax: f32,
}

impl BoundingBox {
    fn around(p: Vec3) -> Self {
        Self { xmin: p[0], xmax: p[0], ymin: p[1], ymax: p[1], zmin: p[2], zmax: p[2] }
    }

    fn include(&mut self, p: Vec3) {
        self.xmin = self.xmin.min(p[0]);
        self.xmax = self.xmax.max(p[0]);
        self.ymin = self.ymin.min(p[1]);
        self.ymax = self.ymax.max(p[1]);
        self.zmin = self.zmin.min(p[2]);
        self.zmax = self.zmax.max(p[2]);
    }

    pub fn union(self, other: BoundingBox) -> Self {
        let mut bb = self;
        bb.include([other.xmin, other.ymin, other.zmin]);
        bb.include([other.xmax, other.ymax, other.zmax]);
        bb
    }
}

impl Tessellation {
    pub fn translate(&mut self, by: Vec3) {
        if by == [0.0; 3] {
            return;
        }
        for v in &mut self.vertices {
            *v = add(*v, by);
        }
        for e in &mut self.edges {
            e[0] = add(e[0], by);
            e[1] = add(e[1], by);
        }
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut points = self.vertices.iter().chain(self.edges.iter().flatten());
        let mut bb = BoundingBox::around(*points.next()?);
        for p in points {
            bb.include(*p);
        }
        Some(bb)
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len() / 3
    }
}

/// The "exportable to a tessellated document" capability
pub trait Tessellate: std::fmt::Debug {
    /// Which kernel produced this shape, for diagnostics
    fn kernel(&self) -> &'static str;

    fn tessellate(&self) -> Result<Tessellation, String>;
}

/// Display attributes shared by every part
#[derive(Debug, Clone, PartialEq)]
pub struct PartStyle {
    pub color: String,
    pub alpha: f32,
}

/// A recognised model: a single part or a named group of models
#[derive(Debug)]
pub enum Geometry {
    Part {
        name: Option<String>,
        style: PartStyle,
        location: Vec3,
        shape: Box<dyn Tessellate>,
    },
    Compound {
        name: Option<String>,
        location: Vec3,
        children: Vec<Geometry>,
    },
}

impl Geometry {
    /// Recognise `value`, or explain why it is not exportable
    pub fn from_value(value: &Value) -> Result<Geometry, String> {
        match value {
            Value::Array(items) => Ok(Geometry::Compound {
                name: None,
                location: [0.0; 3],
                children: parse_children(items)?,
            }),
            Value::Object(obj) => {
                let name = obj.get("name").and_then(Value::as_str).map(str::to_string);
                let location = match obj.get("location") {
                    Some(v) => vec3(v, "location")?,
                    None => [0.0; 3],
                };

                if let Some(parts) = obj.get("parts") {
                    let items = parts.as_array().ok_or("`parts` must be an array")?;
                    return Ok(Geometry::Compound { name, location, children: parse_children(items)? });
                }

                let shape: Box<dyn Tessellate> = if obj.contains_key("vertices") && obj.contains_key("triangles") {
                    Box::new(MeshShape::from_value(value)?)
                } else if obj.contains_key("solid") {
                    Box::new(Solid::from_value(value)?)
                } else {
                    return Err(
                        "no recognized export capability (expected mesh `vertices`/`triangles`, a `solid` primitive, or `parts`)"
                            .to_string(),
                    );
                };
                Ok(Geometry::Part { name, style: parse_style(value)?, location, shape })
            }
            other => Err(format!("no recognized export capability on a {} value", json_kind(other))),
        }
    }
}

fn parse_children(items: &[Value]) -> Result<Vec<Geometry>, String> {
    if items.is_empty() {
        return Err("compound has no parts".to_string());
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| Geometry::from_value(item).map_err(|e| format!("part {}: {}", i, e)))
        .collect()
}

fn parse_style(value: &Value) -> Result<PartStyle, String> {
    let color = match value.get("color") {
        None | Some(Value::Null) => DEFAULT_COLOR.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => {
            let rgb = n.as_u64().filter(|v| *v <= 0xffffff).ok_or("`color` integer must be within 0..=0xffffff")?;
            format!("#{:06x}", rgb)
        }
        Some(_) => return Err("`color` must be a CSS string or an RGB integer".to_string()),
    };
    let alpha = match value.get("alpha") {
        None | Some(Value::Null) => 1.0,
        Some(v) => {
            let a = v.as_f64().ok_or("`alpha` must be a number")? as f32;
            if !(0.0..=1.0).contains(&a) {
                return Err("`alpha` must be within 0..=1".to_string());
            }
            a
        }
    };
    Ok(PartStyle { color, alpha })
}

/// Explicit triangle mesh
#[derive(Debug, Clone, PartialEq)]
pub struct MeshShape {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
    pub normals: Option<Vec<Vec3>>,
    pub edges: Option<Vec<[Vec3; 2]>>,
}

impl MeshShape {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let vertices: Vec<Vec3> = tuples::<3>(&value["vertices"], "vertices")?
            .into_iter()
            .map(|t| t.map(|x| x as f32))
            .collect();
        let triangles = tuples::<3>(&value["triangles"], "triangles")?
            .into_iter()
            .map(|t| {
                let mut tri = [0u32; 3];
                for (slot, idx) in tri.iter_mut().zip(t) {
                    if idx < 0.0 || idx.fract() != 0.0 || idx as usize >= vertices.len() {
                        return Err(format!("triangle index {} out of range (0..{})", idx, vertices.len()));
                    }
                    *slot = idx as u32;
                }
                Ok(tri)
            })
            .collect::<Result<Vec<_>, String>>()?;

        let normals = match value.get("normals") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n: Vec<Vec3> = tuples::<3>(v, "normals")?.into_iter().map(|t| t.map(|x| x as f32)).collect();
                if n.len() != vertices.len() {
                    return Err(format!("{} normals for {} vertices", n.len(), vertices.len()));
                }
                Some(n)
            }
        };

        let edges = match value.get("edges") {
            None | Some(Value::Null) => None,
            Some(v) => Some(segments(v)?),
        };

        Ok(Self { vertices, triangles, normals, edges })
    }

    fn vertex_normals(&self) -> Vec<Vec3> {
        let mut acc = vec![[0.0f32; 3]; self.vertices.len()];
        for tri in &self.triangles {
            let n = face_normal(self.corners(tri));
            for &i in tri {
                acc[i as usize] = add(acc[i as usize], n);
            }
        }
        acc.into_iter().map(|n| normalize(n).unwrap_or([0.0, 0.0, 1.0])).collect()
    }

    /// Boundary edges plus edges whose adjacent faces meet at a sharp angle.
    /// Vertices are welded by position so split-vertex meshes behave.
    fn feature_edges(&self) -> Vec<[Vec3; 2]> {
        type Key = [i64; 3];
        let key = |p: Vec3| -> Key { p.map(|x| (x as f64 * 1e5).round() as i64) };

        let mut adjacency: BTreeMap<(Key, Key), (Vec3, Vec3, Vec<Vec3>)> = BTreeMap::new();
        for tri in &self.triangles {
            let corners = self.corners(tri);
            let n = normalize(face_normal(corners));
            for k in 0..3 {
                let (a, b) = (corners[k], corners[(k + 1) % 3]);
                let (ka, kb) = (key(a), key(b));
                if ka == kb {
                    continue;
                }
                let entry_key = if ka < kb { (ka, kb) } else { (kb, ka) };
                let entry = adjacency.entry(entry_key).or_insert_with(|| (a, b, Vec::new()));
                if let Some(n) = n {
                    entry.2.push(n);
                }
            }
        }

        let cos_limit = FEATURE_ANGLE_DEG.to_radians().cos();
        adjacency
            .into_values()
            .filter(|(_, _, normals)| match normals.as_slice() {
                [a, b] => dot(*a, *b) < cos_limit,
                _ => true,
            })
            .map(|(a, b, _)| [a, b])
            .collect()
    }

    fn corners(&self, tri: &[u32; 3]) -> [Vec3; 3] {
        tri.map(|i| self.vertices[i as usize])
    }
}

impl Tessellate for MeshShape {
    fn kernel(&self) -> &'static str {
        "mesh"
    }

    fn tessellate(&self) -> Result<Tessellation, String> {
        let normals = match &self.normals {
            Some(n) => n.iter().map(|v| normalize(*v).unwrap_or([0.0, 0.0, 1.0])).collect(),
            None => self.vertex_normals(),
        };
        let edges = match &self.edges {
            Some(e) => e.clone(),
            None => self.feature_edges(),
        };
        Ok(Tessellation {
            vertices: self.vertices.clone(),
            normals,
            triangles: self.triangles.iter().flatten().copied().collect(),
            triangles_per_face: vec![self.triangles.len() as u32],
            segments_per_edge: vec![1; edges.len()],
            edges,
        })
    }
}

/// Parametric primitives, centred on the origin with Z up
#[derive(Debug, Clone, PartialEq)]
pub enum Solid {
    Box { size: Vec3 },
    Cylinder { radius: f32, height: f32, segments: u32 },
    Sphere { radius: f32, segments: u32 },
}

impl Solid {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let kind = value["solid"].as_str().ok_or("`solid` must be a string")?;
        let segments = match value.get("segments") {
            None | Some(Value::Null) => DEFAULT_SEGMENTS,
            Some(v) => v
                .as_u64()
                .filter(|s| (3..=1024).contains(s))
                .ok_or("`segments` must be an integer within 3..=1024")? as u32,
        };
        match kind {
            "box" => {
                let size = match value.get("size") {
                    Some(v) => vec3(v, "size")?,
                    None => [1.0; 3],
                };
                if size.iter().any(|d| *d <= 0.0) {
                    return Err("box `size` must be positive".to_string());
                }
                Ok(Solid::Box { size })
            }
            "cylinder" => Ok(Solid::Cylinder {
                radius: positive(value, "radius")?,
                height: positive(value, "height")?,
                segments,
            }),
            "sphere" => Ok(Solid::Sphere { radius: positive(value, "radius")?, segments }),
            other => Err(format!("unknown solid '{}' (expected box, cylinder or sphere)", other)),
        }
    }
}

impl Tessellate for Solid {
    fn kernel(&self) -> &'static str {
        "solid"
    }

    fn tessellate(&self) -> Result<Tessellation, String> {
        Ok(match *self {
            Solid::Box { size } => box_tessellation(size),
            Solid::Cylinder { radius, height, segments } => cylinder_tessellation(radius, height, segments),
            Solid::Sphere { radius, segments } => sphere_tessellation(radius, segments),
        })
    }
}

fn box_tessellation(size: Vec3) -> Tessellation {
    let half = size.map(|d| d / 2.0);
    let mut t = Tessellation::default();

    for axis in 0..3 {
        for sign in [1.0f32, -1.0] {
            // (u, v) chosen so that u x v points along the outward normal
            let (mut u, mut v) = ((axis + 1) % 3, (axis + 2) % 3);
            if sign < 0.0 {
                std::mem::swap(&mut u, &mut v);
            }
            let mut normal = [0.0; 3];
            normal[axis] = sign;

            let base = t.vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let mut p = [0.0; 3];
                p[axis] = sign * half[axis];
                p[u] = su * half[u];
                p[v] = sv * half[v];
                t.vertices.push(p);
                t.normals.push(normal);
            }
            t.triangles.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
            t.triangles_per_face.push(2);
        }
    }

    for axis in 0..3 {
        let (u, v) = ((axis + 1) % 3, (axis + 2) % 3);
        for (su, sv) in [(-1.0f32, -1.0f32), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let mut a = [0.0; 3];
            a[u] = su * half[u];
            a[v] = sv * half[v];
            let mut b = a;
            a[axis] = -half[axis];
            b[axis] = half[axis];
            t.edges.push([a, b]);
            t.segments_per_edge.push(1);
        }
    }
    t
}

fn cylinder_tessellation(radius: f32, height: f32, segments: u32) -> Tessellation {
    let n = segments;
    let z = height / 2.0;
    let ring = |i: u32, z: f32| {
        let a = 2.0 * PI * i as f32 / n as f32;
        [radius * a.cos(), radius * a.sin(), z]
    };
    let mut t = Tessellation::default();

    // Side: bottom ring then top ring, radial normals
    for zz in [-z, z] {
        for i in 0..n {
            let p = ring(i, zz);
            t.vertices.push(p);
            t.normals.push([p[0] / radius, p[1] / radius, 0.0]);
        }
    }
    for i in 0..n {
        let (b0, b1) = (i, (i + 1) % n);
        let (t0, t1) = (n + b0, n + b1);
        t.triangles.extend_from_slice(&[b0, b1, t1, b0, t1, t0]);
    }
    t.triangles_per_face.push(2 * n);

    // Caps: fan around a centre vertex
    for (zz, normal) in [(z, [0.0, 0.0, 1.0]), (-z, [0.0, 0.0, -1.0])] {
        let centre = t.vertices.len() as u32;
        t.vertices.push([0.0, 0.0, zz]);
        t.normals.push(normal);
        for i in 0..n {
            t.vertices.push(ring(i, zz));
            t.normals.push(normal);
        }
        for i in 0..n {
            let (a, b) = (centre + 1 + i, centre + 1 + (i + 1) % n);
            if zz > 0.0 {
                t.triangles.extend_from_slice(&[centre, a, b]);
            } else {
                t.triangles.extend_from_slice(&[centre, b, a]);
            }
        }
        t.triangles_per_face.push(n);
    }

    for zz in [-z, z] {
        for i in 0..n {
            t.edges.push([ring(i, zz), ring((i + 1) % n, zz)]);
        }
        t.segments_per_edge.push(n);
    }
    t
}

fn sphere_tessellation(radius: f32, segments: u32) -> Tessellation {
    let lon = segments;
    let lat = (segments / 2).max(2);
    let mut t = Tessellation::default();

    for j in 0..=lat {
        let phi = PI * j as f32 / lat as f32;
        for i in 0..=lon {
            let theta = 2.0 * PI * i as f32 / lon as f32;
            let n = [phi.sin() * theta.cos(), phi.sin() * theta.sin(), phi.cos()];
            t.vertices.push(n.map(|c| c * radius));
            t.normals.push(n);
        }
    }
    let row = lon + 1;
    for j in 0..lat {
        for i in 0..lon {
            let a = j * row + i;
            let (b, c, d) = (a + row, a + row + 1, a + 1);
            t.triangles.extend_from_slice(&[a, b, c, a, c, d]);
        }
    }
    t.triangles_per_face.push(2 * lat * lon);
    t
}

/// Accept `[[a, b, c], ...]` or a flat list whose length is a multiple of N
fn tuples<const N: usize>(value: &Value, what: &str) -> Result<Vec<[f64; N]>, String> {
    let items = value.as_array().ok_or_else(|| format!("`{}` must be an array", what))?;
    let number = |v: &Value| v.as_f64().ok_or_else(|| format!("`{}` must contain only numbers", what));

    if items.first().map_or(false, Value::is_array) {
        items
            .iter()
            .map(|item| {
                let inner = item.as_array().filter(|a| a.len() == N).ok_or_else(|| {
                    format!("`{}` entries must have {} components", what, N)
                })?;
                let mut out = [0.0; N];
                for (slot, v) in out.iter_mut().zip(inner) {
                    *slot = number(v)?;
                }
                Ok(out)
            })
            .collect()
    } else {
        if items.len() % N != 0 {
            return Err(format!("`{}` length {} is not a multiple of {}", what, items.len(), N));
        }
        items
            .chunks(N)
            .map(|chunk| {
                let mut out = [0.0; N];
                for (slot, v) in out.iter_mut().zip(chunk) {
                    *slot = number(v)?;
                }
                Ok(out)
            })
            .collect()
    }
}

/// Edge segments as `[[p, q], ...]` or flat groups of six numbers
fn segments(value: &Value) -> Result<Vec<[Vec3; 2]>, String> {
    let nested_pairs = value
        .as_array()
        .and_then(|a| a.first())
        .and_then(Value::as_array)
        .map_or(false, |pair| pair.first().map_or(false, Value::is_array));

    let flat: Vec<[f64; 6]> = if nested_pairs {
        let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
        items
            .iter()
            .map(|pair| {
                let pts = tuples::<3>(pair, "edges")?;
                match pts.as_slice() {
                    [p, q] => Ok([p[0], p[1], p[2], q[0], q[1], q[2]]),
                    _ => Err("`edges` entries must be pairs of points".to_string()),
                }
            })
            .collect::<Result<_, String>>()?
    } else {
        tuples::<6>(value, "edges")?
    };

    Ok(flat
        .into_iter()
        .map(|s| [[s[0] as f32, s[1] as f32, s[2] as f32], [s[3] as f32, s[4] as f32, s[5] as f32]])
        .collect())
}

fn vec3(value: &Value, what: &str) -> Result<Vec3, String> {
    match tuples::<3>(value, what)?.as_slice() {
        [t] => Ok(t.map(|x| x as f32)),
        _ => Err(format!("`{}` must be [x, y, z]", what)),
    }
}

fn positive(value: &Value, key: &str) -> Result<f32, String> {
    value
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| *v > 0.0)
        .map(|v| v as f32)
        .ok_or_else(|| format!("`{}` must be a positive number", key))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

fn dot(a: Vec3, b: Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(v: Vec3) -> Option<Vec3> {
    let len = dot(v, v).sqrt();
    (len > f32::EPSILON).then(|| v.map(|c| c / len))
}

/// Unnormalised, so accumulating it weights by triangle area
fn face_normal([a, b, c]: [Vec3; 3]) -> Vec3 {
    cross(sub(b, a), sub(c, a))
}
