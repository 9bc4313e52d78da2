use crate::gop::GopTable;
use crate::media::Micros;

/// What one playhead update asks of the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowPlan {
    /// GOP covering the playhead, if the playhead is on the file.
    pub current: Option<usize>,
    /// Current GOP first, then the forward pre-decode window.
    pub wanted: Vec<usize>,
    /// Held GOPs that dropped out of the window.
    pub release: Vec<usize>,
}

/// Plans the decode window around `time`.
///
/// The window is the current GOP plus every later GOP starting within
/// `margin` of `time`. Held GOPs behind the playhead stay until their end
/// falls more than `margin` behind it. Outside
/// `[-margin, duration + margin]` nothing is wanted.
pub fn plan(
    table: &GopTable,
    time: Micros,
    margin: Micros,
    tolerance: Micros,
    held: &[usize],
) -> WindowPlan {
    let on_file = time >= -margin && time <= table.duration() + margin;
    let Some(current) = on_file.then(|| table.resolve(time, tolerance)).flatten() else {
        return WindowPlan {
            current: None,
            wanted: Vec::new(),
            release: held.to_vec(),
        };
    };

    let mut wanted = vec![current];
    wanted.extend(
        table.entries()[current + 1..]
            .iter()
            .take_while(|gop| gop.timestamp <= time + margin)
            .map(|gop| gop.index),
    );

    let release = held
        .iter()
        .copied()
        .filter(|index| {
            if wanted.contains(index) {
                return false;
            }
            let trailing = *index < current
                && table
                    .get(*index)
                    .is_some_and(|gop| gop.end() >= time - margin);
            !trailing
        })
        .collect();

    WindowPlan {
        current: Some(current),
        wanted,
        release,
    }
}
