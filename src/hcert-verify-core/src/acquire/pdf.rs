//! First-page PDF rendering.
//!
//! A small greyscale renderer covering what certificate PDFs use to draw a
//! QR code: image XObjects placed through the CTM, and filled paths
//! (modules drawn as `re` rectangles or `m`/`l` polygons). Curves are
//! flattened to their end points, strokes and text are not drawn.

use image::{GrayImage, ImageFormat, Luma};
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use tracing::{debug, trace, warn};

/// Rendering resolution.
pub const RENDER_DPI: f64 = 200.0;

/// Upper bound on the rendered frame.
const MAX_CANVAS_PIXELS: u64 = 40_000_000;

/// Upper bound on the pixels of one embedded image.
const MAX_IMAGE_PIXELS: u64 = 40_000_000;

/// Nesting limit for form XObjects.
const MAX_FORM_DEPTH: usize = 8;

/// US Letter, used when a page has no usable MediaBox.
const DEFAULT_MEDIA_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

/// Render page 1 of a PDF into a greyscale frame.
///
/// # Errors
///
/// Returns a description of why no frame could be produced.
pub fn render_first_page(bytes: &[u8]) -> Result<GrayImage, String> {
    let doc = Document::load_mem(bytes).map_err(|e| format!("PDF parse failed: {}", e))?;
    let page_id = *doc
        .get_pages()
        .values()
        .next()
        .ok_or("PDF has no pages")?;

    let media_box = inherited(&doc, page_id, b"MediaBox")
        .and_then(|obj| rect(&doc, obj))
        .unwrap_or(DEFAULT_MEDIA_BOX);
    let resources = inherited(&doc, page_id, b"Resources").and_then(|obj| as_dict(&doc, obj));

    let content = doc.get_page_content(page_id).unwrap_or_default();
    let mut renderer = Renderer::new(&doc, media_box)?;
    renderer.run(&content, resources, Matrix::IDENTITY, 0)?;

    debug!(
        width = renderer.canvas.width(),
        height = renderer.canvas.height(),
        images = renderer.images_drawn,
        fills = renderer.fills_drawn,
        "PDF: first page rendered"
    );
    if renderer.images_drawn == 0 && renderer.fills_drawn == 0 {
        return Err("first page has no drawable content".into());
    }
    Ok(renderer.canvas)
}

/// Decoded image XObject.
enum Raster {
    /// Samples painted as-is.
    Opaque(GrayImage),
    /// Stencil mask: 0 samples take the current fill, the rest are left
    /// untouched.
    Stencil(GrayImage),
}

/// Affine transform `[a b c d e f]` in PDF order.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f64; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    /// `self × other`: apply `self` first, then `other`.
    fn then(&self, other: &Matrix) -> Matrix {
        let [a, b, c, d, e, f] = self.0;
        let [na, nb, nc, nd, ne, nf] = other.0;
        Matrix([
            a * na + b * nc,
            a * nb + b * nd,
            c * na + d * nc,
            c * nb + d * nd,
            e * na + f * nc + ne,
            e * nb + f * nd + nf,
        ])
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [a, b, c, d, e, f] = self.0;
        (a * x + c * y + e, b * x + d * y + f)
    }

    fn invert(&self) -> Option<Matrix> {
        let [a, b, c, d, e, f] = self.0;
        let det = a * d - b * c;
        if det.abs() < f64::EPSILON {
            return None;
        }
        Some(Matrix([
            d / det,
            -b / det,
            -c / det,
            a / det,
            (c * f - d * e) / det,
            (b * e - a * f) / det,
        ]))
    }
}

#[derive(Debug, Clone, Copy)]
struct GraphicsState {
    ctm: Matrix,
    fill: u8,
}

struct Renderer<'a> {
    doc: &'a Document,
    canvas: GrayImage,
    /// User space (page) to device pixels.
    device: Matrix,
    images_drawn: usize,
    fills_drawn: usize,
}

impl<'a> Renderer<'a> {
    fn new(doc: &'a Document, media_box: [f64; 4]) -> Result<Self, String> {
        let [x0, y0, x1, y1] = media_box;
        let (page_w, page_h) = ((x1 - x0).abs(), (y1 - y0).abs());
        let mut scale = RENDER_DPI / 72.0;
        let pixels = page_w * page_h * scale * scale;
        if pixels > MAX_CANVAS_PIXELS as f64 {
            scale *= (MAX_CANVAS_PIXELS as f64 / pixels).sqrt();
        }
        let width = (page_w * scale).ceil() as u32;
        let height = (page_h * scale).ceil() as u32;
        if width == 0 || height == 0 {
            return Err("page has an empty MediaBox".into());
        }

        // Flip y: PDF origin is bottom-left, raster origin top-left.
        let device = Matrix([scale, 0.0, 0.0, -scale, -x0.min(x1) * scale, y0.max(y1) * scale]);
        Ok(Self {
            doc,
            canvas: GrayImage::from_pixel(width, height, Luma([255])),
            device,
            images_drawn: 0,
            fills_drawn: 0,
        })
    }

    fn run(
        &mut self,
        content: &[u8],
        resources: Option<&Dictionary>,
        base: Matrix,
        depth: usize,
    ) -> Result<(), String> {
        let content =
            Content::decode(content).map_err(|e| format!("content stream decode failed: {}", e))?;

        let mut state = GraphicsState { ctm: base, fill: 0 };
        let mut stack: Vec<GraphicsState> = Vec::new();
        let mut path: Vec<Vec<(f64, f64)>> = Vec::new();

        for op in &content.operations {
            let nums: Vec<f64> = op.operands.iter().filter_map(number).collect();
            match op.operator.as_str() {
                "q" => stack.push(state),
                "Q" => {
                    if let Some(saved) = stack.pop() {
                        state = saved;
                    }
                },
                "cm" if nums.len() == 6 => {
                    let m = Matrix([nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]]);
                    state.ctm = m.then(&state.ctm);
                },
                "g" if nums.len() == 1 => state.fill = gray_level(nums[0]),
                "rg" if nums.len() == 3 => state.fill = rgb_level(nums[0], nums[1], nums[2]),
                "k" if nums.len() == 4 => state.fill = cmyk_level(nums[0], nums[1], nums[2], nums[3]),
                "sc" | "scn" => match nums.len() {
                    1 => state.fill = gray_level(nums[0]),
                    3 => state.fill = rgb_level(nums[0], nums[1], nums[2]),
                    4 => state.fill = cmyk_level(nums[0], nums[1], nums[2], nums[3]),
                    _ => {},
                },
                "re" if nums.len() == 4 => {
                    let (x, y, w, h) = (nums[0], nums[1], nums[2], nums[3]);
                    let to_device = state.ctm.then(&self.device);
                    path.push(
                        [(x, y), (x + w, y), (x + w, y + h), (x, y + h)]
                            .iter()
                            .map(|&(px, py)| to_device.apply(px, py))
                            .collect(),
                    );
                },
                "m" if nums.len() == 2 => {
                    let to_device = state.ctm.then(&self.device);
                    path.push(vec![to_device.apply(nums[0], nums[1])]);
                },
                "l" | "c" | "v" | "y" if nums.len() >= 2 => {
                    let to_device = state.ctm.then(&self.device);
                    let (x, y) = (nums[nums.len() - 2], nums[nums.len() - 1]);
                    if let Some(sub) = path.last_mut() {
                        sub.push(to_device.apply(x, y));
                    }
                },
                "f" | "F" | "B" | "b" => {
                    self.fill_path(&path, state.fill, false);
                    path.clear();
                },
                "f*" | "B*" | "b*" => {
                    self.fill_path(&path, state.fill, true);
                    path.clear();
                },
                "n" | "S" | "s" => path.clear(),
                "Do" => {
                    if let Some(Object::Name(name)) = op.operands.first() {
                        self.draw_xobject(name, resources, state, depth);
                    }
                },
                _ => {},
            }
        }
        Ok(())
    }

    fn draw_xobject(
        &mut self,
        name: &[u8],
        resources: Option<&Dictionary>,
        state: GraphicsState,
        depth: usize,
    ) {
        let ctm = state.ctm;
        let Some(stream) = resources
            .and_then(|r| r.get(b"XObject").ok())
            .and_then(|x| as_dict(self.doc, x))
            .and_then(|x| x.get(name).ok())
            .and_then(|obj| as_stream(self.doc, obj))
        else {
            trace!(name = %String::from_utf8_lossy(name), "PDF: XObject not found");
            return;
        };

        match stream.dict.get(b"Subtype") {
            Ok(Object::Name(subtype)) if subtype.as_slice() == b"Image" => {
                match decode_image(self.doc, stream) {
                    Some(raster) => {
                        self.draw_image(&raster, ctm, state.fill);
                        self.images_drawn += 1;
                    },
                    None => {
                        warn!(name = %String::from_utf8_lossy(name), "PDF: image XObject not decodable");
                    },
                }
            },
            Ok(Object::Name(subtype)) if subtype.as_slice() == b"Form" => {
                if depth >= MAX_FORM_DEPTH {
                    warn!("PDF: form XObject nesting too deep");
                    return;
                }
                let matrix = stream
                    .dict
                    .get(b"Matrix")
                    .ok()
                    .and_then(|m| matrix(self.doc, m))
                    .unwrap_or(Matrix::IDENTITY);
                let form_resources = stream
                    .dict
                    .get(b"Resources")
                    .ok()
                    .and_then(|r| as_dict(self.doc, r))
                    .or(resources);
                let content = match stream.decompressed_content() {
                    Ok(content) => content,
                    Err(_) => stream.content.clone(),
                };
                if let Err(e) = self.run(&content, form_resources, matrix.then(&ctm), depth + 1) {
                    warn!("PDF: form XObject skipped: {}", e);
                }
            },
            _ => {},
        }
    }

    /// Draw an image mapped onto the unit square by `ctm`.
    fn draw_image(&mut self, raster: &Raster, ctm: Matrix, fill: u8) {
        let image = match raster {
            Raster::Opaque(image) | Raster::Stencil(image) => image,
        };
        let to_device = ctm.then(&self.device);
        let Some(inverse) = to_device.invert() else {
            return;
        };

        let corners = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)].map(|(u, v)| to_device.apply(u, v));
        let Some((x0, y0, x1, y1)) = self.clip(&corners) else {
            return;
        };

        let (w, h) = (f64::from(image.width()), f64::from(image.height()));
        for dy in y0..y1 {
            for dx in x0..x1 {
                let (u, v) = inverse.apply(f64::from(dx) + 0.5, f64::from(dy) + 0.5);
                if !(0.0..1.0).contains(&u) || !(0.0..1.0).contains(&v) {
                    continue;
                }
                // Image row 0 sits at the top of the unit square (v = 1).
                let sx = (u * w) as u32;
                let sy = ((1.0 - v) * h) as u32;
                let Luma([sample]) =
                    *image.get_pixel(sx.min(image.width() - 1), sy.min(image.height() - 1));
                match raster {
                    Raster::Opaque(_) => self.canvas.put_pixel(dx, dy, Luma([sample])),
                    Raster::Stencil(_) if sample == 0 => self.canvas.put_pixel(dx, dy, Luma([fill])),
                    Raster::Stencil(_) => {},
                }
            }
        }
    }

    /// Scanline fill of device-space polygons.
    fn fill_path(&mut self, path: &[Vec<(f64, f64)>], level: u8, even_odd: bool) {
        let points: Vec<(f64, f64)> = path.iter().flatten().copied().collect();
        let Some((x0, y0, x1, y1)) = self.clip(&points) else {
            return;
        };

        let edges: Vec<((f64, f64), (f64, f64))> = path
            .iter()
            .filter(|sub| sub.len() >= 3)
            .flat_map(|sub| {
                sub.iter()
                    .zip(sub.iter().cycle().skip(1))
                    .map(|(&p, &q)| (p, q))
            })
            .collect();
        if edges.is_empty() {
            return;
        }

        let mut crossings: Vec<(f64, i32)> = Vec::new();
        for dy in y0..y1 {
            let sy = f64::from(dy) + 0.5;
            crossings.clear();
            for &((ax, ay), (bx, by)) in &edges {
                if (ay <= sy && by > sy) || (by <= sy && ay > sy) {
                    let x = ax + (sy - ay) * (bx - ax) / (by - ay);
                    crossings.push((x, if by > ay { 1 } else { -1 }));
                }
            }
            crossings.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut winding = 0;
            for pair in crossings.windows(2) {
                winding += pair[0].1;
                let inside = if even_odd { winding % 2 != 0 } else { winding != 0 };
                if !inside {
                    continue;
                }
                let start = (pair[0].0 - 0.5).ceil().max(f64::from(x0)) as u32;
                let end = (pair[1].0 - 0.5).ceil().min(f64::from(x1)) as u32;
                for dx in start..end {
                    self.canvas.put_pixel(dx, dy, Luma([level]));
                }
            }
        }
        self.fills_drawn += 1;
    }

    /// Bounding box of `points` clipped to the canvas, as pixel ranges.
    fn clip(&self, points: &[(f64, f64)]) -> Option<(u32, u32, u32, u32)> {
        if points.is_empty() {
            return None;
        }
        let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
        let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
        for &(x, y) in points {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        let w = f64::from(self.canvas.width());
        let h = f64::from(self.canvas.height());
        let x0 = min_x.floor().clamp(0.0, w) as u32;
        let y0 = min_y.floor().clamp(0.0, h) as u32;
        let x1 = max_x.ceil().clamp(0.0, w) as u32;
        let y1 = max_y.ceil().clamp(0.0, h) as u32;
        (x0 < x1 && y0 < y1).then_some((x0, y0, x1, y1))
    }
}

/// Decode an image XObject to greyscale.
fn decode_image(doc: &Document, stream: &Stream) -> Option<Raster> {
    let dict = &stream.dict;
    let width = dict.get(b"Width").ok().and_then(number)? as u32;
    let height = dict.get(b"Height").ok().and_then(number)? as u32;
    if width == 0 || height == 0 || u64::from(width) * u64::from(height) > MAX_IMAGE_PIXELS {
        return None;
    }

    let filters = filter_names(doc, dict);
    if filters.iter().any(|f| f == b"DCTDecode") {
        return image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
            .ok()
            .map(|img| Raster::Opaque(img.to_luma8()));
    }
    if filters.iter().any(|f| f != b"FlateDecode") {
        debug!(
            filters = ?filters.iter().map(|f| String::from_utf8_lossy(f).into_owned()).collect::<Vec<_>>(),
            "PDF: unsupported image filter"
        );
        return None;
    }

    let data = if filters.is_empty() {
        stream.content.clone()
    } else {
        stream.decompressed_content().ok()?
    };

    let is_mask = matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true)));
    let bits = if is_mask {
        1
    } else {
        dict.get(b"BitsPerComponent").ok().and_then(number).unwrap_or(8.0) as u32
    };
    let components = if is_mask {
        1
    } else {
        color_components(doc, dict.get(b"ColorSpace").ok())
    };

    let mut samples = raw_to_gray(&data, width, height, components, bits)?;
    if !is_mask {
        return Some(Raster::Opaque(samples));
    }
    // `/Decode [1 0]` paints the 1 bits instead.
    let inverted = match dict.get(b"Decode").ok().map(|d| resolve(doc, d)) {
        Some(Object::Array(range)) => range.first().and_then(number) == Some(1.0),
        _ => false,
    };
    if inverted {
        image::imageops::invert(&mut samples);
    }
    Some(Raster::Stencil(samples))
}

fn raw_to_gray(
    data: &[u8],
    width: u32,
    height: u32,
    components: u32,
    bits: u32,
) -> Option<GrayImage> {
    let w = width as usize;
    let mut image = GrayImage::new(width, height);
    match (components, bits) {
        (1, 1) => {
            let stride = w.div_ceil(8);
            if data.len() < stride * height as usize {
                return None;
            }
            for (y, row) in data.chunks(stride).take(height as usize).enumerate() {
                for x in 0..w {
                    // 0 is black in DeviceGray and painted in a stencil mask.
                    let bit = (row[x / 8] >> (7 - (x % 8))) & 1;
                    image.put_pixel(x as u32, y as u32, Luma([if bit == 1 { 255 } else { 0 }]));
                }
            }
        },
        (n @ (1 | 3 | 4), 8) => {
            let n = n as usize;
            let stride = w * n;
            if data.len() < stride * height as usize {
                return None;
            }
            for (y, row) in data.chunks(stride).take(height as usize).enumerate() {
                for (x, px) in row.chunks(n).take(w).enumerate() {
                    let level = match px {
                        [g] => *g,
                        [r, g, b] => luma(*r, *g, *b),
                        [c, m, ye, k] => cmyk_level(
                            f64::from(*c) / 255.0,
                            f64::from(*m) / 255.0,
                            f64::from(*ye) / 255.0,
                            f64::from(*k) / 255.0,
                        ),
                        _ => 255,
                    };
                    image.put_pixel(x as u32, y as u32, Luma([level]));
                }
            }
        },
        _ => return None,
    }
    Some(image)
}

fn filter_names(doc: &Document, dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter").ok().map(|f| resolve(doc, f)) {
        Some(Object::Name(name)) => vec![name.clone()],
        Some(Object::Array(items)) => items
            .iter()
            .filter_map(|item| match resolve(doc, item) {
                Object::Name(name) => Some(name.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn color_components(doc: &Document, space: Option<&Object>) -> u32 {
    match space.map(|s| resolve(doc, s)) {
        Some(Object::Name(name)) => match name.as_slice() {
            b"DeviceRGB" | b"CalRGB" => 3,
            b"DeviceCMYK" => 4,
            _ => 1,
        },
        Some(Object::Array(items)) => match items.first().map(|i| resolve(doc, i)) {
            Some(Object::Name(kind)) if kind.as_slice() == b"ICCBased" => items
                .get(1)
                .and_then(|profile| as_stream(doc, profile))
                .and_then(|s| s.dict.get(b"N").ok())
                .and_then(number)
                .map_or(3, |n| n as u32),
            Some(Object::Name(kind)) if kind.as_slice() == b"CalRGB" => 3,
            _ => 1,
        },
        _ => 1,
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b)) / 1000) as u8
}

fn gray_level(g: f64) -> u8 {
    (g.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn rgb_level(r: f64, g: f64, b: f64) -> u8 {
    luma(gray_level(r), gray_level(g), gray_level(b))
}

fn cmyk_level(c: f64, m: f64, y: f64, k: f64) -> u8 {
    let ink = 0.3 * c + 0.59 * m + 0.11 * y + k;
    gray_level(1.0 - ink.min(1.0))
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    let mut current = obj;
    for _ in 0..8 {
        match current {
            Object::Reference(id) => match doc.get_object(*id) {
                Ok(next) => current = next,
                Err(_) => return current,
            },
            _ => return current,
        }
    }
    current
}

fn as_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, obj) {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

fn as_stream<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Stream> {
    match resolve(doc, obj) {
        Object::Stream(stream) => Some(stream),
        _ => None,
    }
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

fn rect(doc: &Document, obj: &Object) -> Option<[f64; 4]> {
    match resolve(doc, obj) {
        Object::Array(items) if items.len() == 4 => {
            let mut out = [0.0; 4];
            for (slot, item) in out.iter_mut().zip(items) {
                *slot = number(resolve(doc, item))?;
            }
            Some(out)
        },
        _ => None,
    }
}

fn matrix(doc: &Document, obj: &Object) -> Option<Matrix> {
    match resolve(doc, obj) {
        Object::Array(items) if items.len() == 6 => {
            let mut out = [0.0; 6];
            for (slot, item) in out.iter_mut().zip(items) {
                *slot = number(resolve(doc, item))?;
            }
            Some(Matrix(out))
        },
        _ => None,
    }
}

/// Look up a page attribute, following `Parent` links for inheritable keys.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..32 {
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
        node = match node.get(b"Parent") {
            Ok(Object::Reference(parent)) => doc.get_dictionary(*parent).ok()?,
            _ => return None,
        };
    }
    None
}
