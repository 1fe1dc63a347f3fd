use std::fmt::Write as _;
use std::path::PathBuf;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::segment::Segment;

pub const DEFAULT_MAX_SEGMENT_DURATION: u32 = 5;
pub const DEFAULT_LIVE_SEGMENTS: usize = 3;

const HLS_VERSION: u32 = 6;

/// Sliding live window over the current and next track's segments.
///
/// Holds no lock of its own: the station mutates it under its state lock and
/// must call `generate` with non-decreasing elapsed times, otherwise the
/// sequence counters stop being monotonic.
#[derive(Debug, Clone)]
pub struct Playlist {
    live_segments: usize,
    max_segment_duration: u32,

    media_sequence: u64,
    discon_sequence: u64,
    last_discon_update: Option<OffsetDateTime>,
    /// A promoted track has not had its boundary counted yet.
    boundary_pending: bool,

    current: Vec<Segment>,
    next: Vec<Segment>,
    head_segment: Option<PathBuf>,
}

impl Playlist {
    pub fn new(
        current: Vec<Segment>,
        next: Vec<Segment>,
        max_segment_duration: u32,
        live_segments: usize,
    ) -> Self {
        Self {
            live_segments,
            max_segment_duration: max_segment_duration.max(1),
            media_sequence: 0,
            discon_sequence: 0,
            last_discon_update: None,
            boundary_pending: false,
            current,
            next,
            head_segment: None,
        }
    }

    pub fn generate(&mut self, elapsed: f64) -> String {
        self.generate_at(elapsed, OffsetDateTime::now_utc())
    }

    /// Renders the live window for `elapsed` seconds into the current track.
    pub fn generate_at(&mut self, elapsed: f64, now: OffsetDateTime) -> String {
        let index = self.segment_index(elapsed);
        let window = self.live_window(index);

        // Counted against the media sequence of the previous render.
        self.update_discon_sequence(index, now);

        let head = window.first().map(|s| s.path.clone());
        if head.is_some() && head != self.head_segment {
            self.media_sequence += 1;
            self.head_segment = head;
        }

        let offset = elapsed.max(0.0) % f64::from(self.max_segment_duration);
        let mut out = render_header(
            now,
            self.max_segment_duration,
            self.media_sequence,
            self.discon_sequence,
            offset,
        );
        for segment in &window {
            render_segment(&mut out, segment);
        }
        out
    }

    /// Track transition: the next track becomes current.
    pub fn next(&mut self, segments: Vec<Segment>) {
        self.current = std::mem::replace(&mut self.next, segments);
        self.boundary_pending = true;
    }

    /// The upcoming track changed while the current one keeps playing.
    pub fn replace_next(&mut self, segments: Vec<Segment>) {
        self.next = segments;
    }

    pub fn add_segments(&mut self, segments: Vec<Segment>) {
        self.next.extend(segments);
    }

    pub fn first_next_segment(&self) -> Option<&Segment> {
        self.next.first()
    }

    pub fn current_segments(&self) -> &[Segment] {
        &self.current
    }

    pub fn next_segments(&self) -> &[Segment] {
        &self.next
    }

    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    pub fn discon_sequence(&self) -> u64 {
        self.discon_sequence
    }

    /// Ids of every track whose segments the playlist can still emit.
    pub fn referenced_tracks(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for segment in self.current.iter().chain(self.next.iter()) {
            if !ids.contains(&segment.track_id) {
                ids.push(segment.track_id.clone());
            }
        }
        ids
    }

    fn segment_index(&self, elapsed: f64) -> usize {
        if !(elapsed > 0.0) {
            return 0;
        }
        (elapsed / f64::from(self.max_segment_duration)).floor() as usize
    }

    fn live_window(&self, index: usize) -> Vec<Segment> {
        let mut window: Vec<Segment> = self
            .current
            .iter()
            .skip(index)
            .take(self.live_segments)
            .cloned()
            .collect();

        let missing = self.live_segments - window.len();
        window.extend(self.next.iter().take(missing).cloned());
        window
    }

    // The window head sitting on the second segment of a promoted track means
    // its tagged first segment has just slid out. Only tracks that came in
    // through `next` count, and the debounce window opens at the first render.
    fn update_discon_sequence(&mut self, index: usize, now: OffsetDateTime) {
        let last = *self.last_discon_update.get_or_insert(now);
        if (now - last).as_seconds_f64() < f64::from(self.max_segment_duration) {
            return;
        }

        if index == 1 && self.media_sequence > 1 && self.boundary_pending {
            self.boundary_pending = false;
            self.discon_sequence += 1;
            self.last_discon_update = Some(now);
        }
    }
}

fn render_header(
    now: OffsetDateTime,
    target_duration: u32,
    media_sequence: u64,
    discon_sequence: u64,
    offset: f64,
) -> String {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    let program_time = now.format(&format).unwrap_or_default();

    format!(
        "#EXTM3U\n\
         #EXT-X-VERSION:{HLS_VERSION}\n\
         #EXT-X-PROGRAM-DATE-TIME:{program_time}\n\
         #EXT-X-TARGETDURATION:{target_duration}\n\
         #EXT-X-MEDIA-SEQUENCE:{media_sequence}\n\
         #EXT-X-DISCONTINUITY-SEQUENCE:{discon_sequence}\n\
         #EXT-X-START:TIME-OFFSET={offset:.2}\n"
    )
}

fn render_segment(out: &mut String, segment: &Segment) {
    if segment.is_first {
        out.push_str("#EXT-X-DISCONTINUITY\n");
    }
    let _ = write!(
        out,
        "#EXTINF:{:.2},\n{}\n",
        segment.duration,
        segment.path.display()
    );
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use time::macros::datetime;
    use time::Duration;

    use super::*;
    use crate::segment::generate_segments;

    fn seg(name: &str, duration: f64, is_first: bool) -> Segment {
        Segment {
            duration,
            path: PathBuf::from(name),
            is_first,
            track_id: name.split('-').next().unwrap_or(name).to_string(),
        }
    }

    fn window_paths(text: &str) -> Vec<String> {
        text.lines()
            .filter(|l| !l.starts_with('#') && !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn abc_d() -> Playlist {
        Playlist::new(
            vec![seg("A", 5.0, true), seg("B", 5.0, false), seg("C", 5.0, false)],
            vec![seg("D", 5.0, true)],
            5,
            3,
        )
    }

    const T0: OffsetDateTime = datetime!(2026-03-01 12:00:00.250 UTC);

    #[test]
    fn window_starts_with_current_track() {
        let mut pl = abc_d();
        assert_eq!(window_paths(&pl.generate_at(0.0, T0)), ["A", "B", "C"]);
    }

    #[test]
    fn window_fills_from_next_track() {
        let mut pl = abc_d();
        assert_eq!(window_paths(&pl.generate_at(12.0, T0)), ["C", "D"]);
    }

    #[test]
    fn window_past_current_comes_from_next_front() {
        let mut pl = Playlist::new(
            vec![seg("A", 5.0, true)],
            vec![seg("B", 5.0, true), seg("C", 5.0, false)],
            5,
            3,
        );
        assert_eq!(window_paths(&pl.generate_at(20.0, T0)), ["B", "C"]);
    }

    #[test]
    fn empty_tracks_render_header_only() {
        let mut pl = Playlist::new(Vec::new(), Vec::new(), 5, 3);
        let text = pl.generate_at(0.0, T0);
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(window_paths(&text).is_empty());
        assert_eq!(pl.media_sequence(), 0);
    }

    #[test]
    fn renders_protocol_text() {
        let mut pl = Playlist::new(
            generate_segments(12.0, 5.0, "t1", Path::new("static/tmp")),
            Vec::new(),
            5,
            3,
        );
        let text = pl.generate_at(11.0, T0);
        let expected = "#EXTM3U\n\
            #EXT-X-VERSION:6\n\
            #EXT-X-PROGRAM-DATE-TIME:2026-03-01T12:00:00.250Z\n\
            #EXT-X-TARGETDURATION:5\n\
            #EXT-X-MEDIA-SEQUENCE:1\n\
            #EXT-X-DISCONTINUITY-SEQUENCE:0\n\
            #EXT-X-START:TIME-OFFSET=1.00\n\
            #EXTINF:2.00,\n\
            static/tmp/t1-2.ts\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn discontinuity_marker_precedes_first_segment() {
        let mut pl = abc_d();
        let text = pl.generate_at(10.0, T0);
        assert!(text.contains("#EXTINF:5.00,\nC\n#EXT-X-DISCONTINUITY\n#EXTINF:5.00,\nD\n"));
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(!text.contains("#EXT-X-DISCONTINUITY\n#EXTINF:5.00,\nC"));
    }

    #[test]
    fn generate_is_idempotent_for_same_input() {
        let mut pl = abc_d();
        let first = pl.generate_at(5.0, T0);
        let second = pl.generate_at(5.0, T0);
        assert_eq!(first, second);
        assert_eq!(pl.media_sequence(), 1);
    }

    #[test]
    fn media_sequence_advances_once_per_retired_segment() {
        let mut pl = Playlist::new(
            generate_segments(30.0, 5.0, "t", Path::new("d")),
            Vec::new(),
            5,
            3,
        );
        let mut last = 0;
        for second in 0..30 {
            let now = T0 + Duration::seconds(second);
            pl.generate_at(second as f64, now);
            assert!(pl.media_sequence() >= last);
            last = pl.media_sequence();
        }
        assert_eq!(pl.media_sequence(), 6);
    }

    #[test]
    fn discontinuity_counted_once_per_track_boundary() {
        let mut pl = Playlist::new(
            generate_segments(10.0, 5.0, "a", Path::new("d")),
            generate_segments(10.0, 5.0, "b", Path::new("d")),
            5,
            3,
        );
        let mut clock = T0;
        let mut elapsed = 0.0;
        for _ in 0..10 {
            pl.generate_at(elapsed, clock);
            elapsed += 1.0;
            clock += Duration::seconds(1);
        }
        assert_eq!(pl.discon_sequence(), 0);
        assert_eq!(pl.media_sequence(), 2);

        pl.next(generate_segments(10.0, 5.0, "c", Path::new("d")));
        elapsed = 0.0;
        for _ in 0..10 {
            pl.generate_at(elapsed, clock);
            elapsed += 1.0;
            clock += Duration::seconds(1);
        }
        assert_eq!(pl.discon_sequence(), 1);
        assert_eq!(pl.media_sequence(), 4);
    }

    #[test]
    fn first_track_of_a_session_adds_no_discontinuity() {
        let mut pl = Playlist::new(
            generate_segments(10.0, 5.0, "a", Path::new("d")),
            generate_segments(10.0, 5.0, "b", Path::new("d")),
            5,
            3,
        );
        // Second segment of the first track, well past the debounce window.
        pl.generate_at(0.0, T0);
        let text = pl.generate_at(5.0, T0 + Duration::seconds(30));
        assert_eq!(pl.media_sequence(), 2);
        assert_eq!(pl.discon_sequence(), 0);
        assert!(text.contains("#EXT-X-DISCONTINUITY-SEQUENCE:0\n"));
    }

    #[test]
    fn discontinuity_waits_out_the_first_segment_duration() {
        let mut pl = Playlist::new(
            generate_segments(5.0, 5.0, "a", Path::new("d")),
            generate_segments(10.0, 5.0, "b", Path::new("d")),
            5,
            3,
        );
        pl.generate_at(0.0, T0);
        pl.next(generate_segments(10.0, 5.0, "c", Path::new("d")));
        pl.generate_at(0.0, T0 + Duration::seconds(1));
        // Boundary reached sooner than one segment after the first render.
        pl.generate_at(5.0, T0 + Duration::seconds(2));
        assert_eq!(pl.discon_sequence(), 0);
        pl.generate_at(5.0, T0 + Duration::seconds(6));
        assert_eq!(pl.discon_sequence(), 1);
    }

    #[test]
    fn next_promotes_upcoming_segments() {
        let mut pl = abc_d();
        pl.next(vec![seg("E", 4.0, true)]);
        assert_eq!(pl.current_segments(), &[seg("D", 5.0, true)]);
        assert_eq!(pl.next_segments(), &[seg("E", 4.0, true)]);
    }

    #[test]
    fn replace_next_keeps_current() {
        let mut pl = abc_d();
        pl.replace_next(vec![seg("X", 3.0, true)]);
        assert_eq!(pl.current_segments().len(), 3);
        assert_eq!(pl.first_next_segment().map(|s| s.track_id.as_str()), Some("X"));
    }

    #[test]
    fn add_segments_appends_to_next() {
        let mut pl = abc_d();
        pl.add_segments(vec![seg("E", 5.0, false), seg("F", 2.5, false)]);
        assert_eq!(pl.next_segments().len(), 3);
        assert_eq!(pl.next_segments()[2].path, PathBuf::from("F"));
    }

    #[test]
    fn referenced_tracks_lists_current_and_next() {
        let pl = Playlist::new(
            generate_segments(12.0, 5.0, "a", Path::new("d")),
            generate_segments(6.0, 5.0, "b", Path::new("d")),
            5,
            3,
        );
        assert_eq!(pl.referenced_tracks(), vec!["a".to_string(), "b".to_string()]);
    }
}
