//! Cursor overlay for grabbers whose platform image omits the pointer

/// Arrow bitmap: `#` outline, `.` fill, space transparent
const ARROW: [&str; 17] = [
    "#          ",
    "##         ",
    "#.#        ",
    "#..#       ",
    "#...#      ",
    "#....#     ",
    "#.....#    ",
    "#......#   ",
    "#.......#  ",
    "#........# ",
    "#.....#####",
    "#..#..#    ",
    "#.# #..#   ",
    "##  #..#   ",
    "#    #..#  ",
    "     #..#  ",
    "      ##   ",
];

const OUTLINE: [u8; 4] = [0, 0, 0, 255];
const FILL: [u8; 4] = [255, 255, 255, 255];

/// Draw an arrow cursor with its hot spot at (`x`, `y`) pixels
///
/// `data` is BGRA with `stride` bytes per row. `scale` is the pixel density
/// of the image; the arrow is sized in points. Parts outside the image are
/// clipped.
pub fn overlay_arrow(data: &mut [u8], width: u32, height: u32, stride: u32, x: i64, y: i64, scale: f64) {
    let scale = scale.max(1.0);
    let rows = (ARROW.len() as f64 * scale).ceil() as i64;
    let cols = (ARROW[0].len() as f64 * scale).ceil() as i64;

    for dy in 0..rows {
        let py = y + dy;
        if py < 0 || py >= height as i64 {
            continue;
        }
        let row = ARROW[((dy as f64 / scale) as usize).min(ARROW.len() - 1)].as_bytes();
        for dx in 0..cols {
            let px = x + dx;
            if px < 0 || px >= width as i64 {
                continue;
            }
            let color = match row.get((dx as f64 / scale) as usize) {
                Some(b'#') => OUTLINE,
                Some(b'.') => FILL,
                _ => continue,
            };
            let offset = py as usize * stride as usize + px as usize * 4;
            if let Some(pixel) = data.get_mut(offset..offset + 4) {
                pixel.copy_from_slice(&color);
            }
        }
    }
}
