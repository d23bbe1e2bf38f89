use std::{collections::VecDeque, io::stdout, time::Duration};

use crate::gui::error::MonitorError;
use crate::session::{SessionController, SessionPhase, SessionStatus};
use crate::summary::SignalLevel;

use crossterm::{
    event::{self, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};

use ratatui::{
    prelude::*,
    widgets::{block::Title, *},
    Terminal,
};

const TICK: Duration = Duration::from_millis(250);
const WINDOW_LEN: usize = 240;

/// Shows the live state of the active session until the user presses a key
/// or the session ends on its own. Returns the last status drawn.
///
/// The session is not stopped here; that is up to the caller.
pub fn monitor_session(controller: &SessionController) -> Result<SessionStatus, MonitorError> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;

    let res = run(controller);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    res
}

fn run(controller: &SessionController) -> Result<SessionStatus, MonitorError> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;
    let mut window = RssiWindow::new(WINDOW_LEN);

    loop {
        let status = controller.status();
        window.observe(status.elapsed_seconds, status.rssi.current);
        let points = window.points();
        terminal.draw(|frame| draw(frame, &status, &points, window.bounds()))?;

        if status.phase != SessionPhase::Active {
            return Ok(status);
        }
        if event::poll(TICK)? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(status);
                }
            }
        }
    }
}

fn draw(frame: &mut Frame, status: &SessionStatus, points: &[(f64, f64)], bounds: Bounds) {
    let [top, bottom] = {
        let areas = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(9), Constraint::Min(6)])
            .split(frame.size());
        [areas[0], areas[1]]
    };

    let title = Title::from(" Collecting CSI... ".magenta().bold());
    let block = Block::default()
        .title(title.alignment(Alignment::Center))
        .borders(Borders::ALL);
    frame.render_widget(Paragraph::new(status_lines(status)).block(block), top);

    let dataset = Dataset::default()
        .name("RSSI")
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Cyan))
        .data(points);
    let chart = Chart::new(vec![dataset])
        .block(Block::default().title(" RSSI (dBm) ").borders(Borders::ALL))
        .x_axis(
            Axis::default()
                .title("s")
                .style(Style::default().fg(Color::Gray))
                .bounds(bounds.x)
                .labels(axis_labels(bounds.x)),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds(bounds.y)
                .labels(axis_labels(bounds.y)),
        );
    frame.render_widget(chart, bottom);
}

fn status_lines(status: &SessionStatus) -> Vec<Line<'static>> {
    let rssi = &status.rssi;
    let current = match rssi.current {
        Some(value) => format!("{} dBm", value),
        None => "n/a".to_owned(),
    };
    let band = rssi.mean().map(|mean| {
        let level = SignalLevel::classify(mean);
        format!("{:?} ({})", level, level.distance_hint())
    });
    let video = if status.recording_video {
        format!("{} frames", status.video_frames)
    } else {
        "off".to_owned()
    };

    vec![
        Line::from(vec![
            " Session ".bold(),
            status.label.clone().unwrap_or_default().into(),
            format!("  ({:?})", status.phase).into(),
        ]),
        Line::from(format!(
            " Packets {}   {:.1} pkt/s   {:.0}s elapsed",
            status.packet_count, status.rate, status.elapsed_seconds
        )),
        Line::from(format!(
            " RSSI {}   mean {}   min {}   max {}",
            current,
            rssi.mean().map_or("n/a".to_owned(), |m| format!("{:.1}", m)),
            rssi.min.map_or("n/a".to_owned(), |m| m.to_string()),
            rssi.max.map_or("n/a".to_owned(), |m| m.to_string()),
        )),
        Line::from(format!(" Signal {}", band.unwrap_or_else(|| "n/a".to_owned()))),
        Line::from(format!(" Devices {}", status.devices.join(", "))),
        Line::from(format!(" Video {}", video)),
        Line::from(""),
        Line::from(" Press any key to stop ".dim()),
    ]
}

fn axis_labels(bounds: [f64; 2]) -> Vec<Span<'static>> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    [bounds[0], mid, bounds[1]]
        .iter()
        .map(|v| Span::from(format!("{:.0}", v)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    x: [f64; 2],
    y: [f64; 2],
}

/// The last few RSSI samples, one per tick.
#[derive(Debug)]
struct RssiWindow {
    points: VecDeque<(f64, f64)>,
    capacity: usize,
}

impl RssiWindow {
    fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn observe(&mut self, elapsed: f64, rssi: Option<i32>) {
        let Some(rssi) = rssi else { return };
        if self.points.back().is_some_and(|&(t, _)| t >= elapsed) {
            return;
        }
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back((elapsed, rssi as f64));
    }

    fn points(&self) -> Vec<(f64, f64)> {
        self.points.iter().copied().collect()
    }

    /// Axis bounds with a little headroom, or a sensible default when empty.
    fn bounds(&self) -> Bounds {
        let (Some(first), Some(last)) = (self.points.front(), self.points.back()) else {
            return Bounds {
                x: [0.0, 60.0],
                y: [-100.0, 0.0],
            };
        };
        let (lo, hi) = self
            .points
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, r)| {
                (lo.min(r), hi.max(r))
            });
        Bounds {
            x: [first.0, last.0.max(first.0 + 1.0)],
            y: [lo - 5.0, hi + 5.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_the_newest_samples() {
        let mut window = RssiWindow::new(3);
        for (t, r) in [(1.0, -60), (2.0, -61), (3.0, -62), (4.0, -63)] {
            window.observe(t, Some(r));
        }
        assert_eq!(window.points(), vec![(2.0, -61.0), (3.0, -62.0), (4.0, -63.0)]);
    }

    #[test]
    fn window_skips_gaps_and_repeats() {
        let mut window = RssiWindow::new(10);
        window.observe(1.0, None);
        window.observe(1.0, Some(-50));
        window.observe(1.0, Some(-51));
        window.observe(0.5, Some(-52));
        assert_eq!(window.points(), vec![(1.0, -50.0)]);
    }

    #[test]
    fn bounds_pad_the_data() {
        let mut window = RssiWindow::new(10);
        assert_eq!(window.bounds().y, [-100.0, 0.0]);
        window.observe(2.0, Some(-70));
        window.observe(5.0, Some(-40));
        assert_eq!(
            window.bounds(),
            Bounds {
                x: [2.0, 5.0],
                y: [-75.0, -35.0]
            }
        );
    }

    #[test]
    fn status_text_mentions_the_essentials() {
        let status = SessionStatus {
            phase: SessionPhase::Active,
            label: Some("3".to_owned()),
            packet_count: 42,
            elapsed_seconds: 2.0,
            rate: 21.0,
            rssi: Default::default(),
            csv_path: None,
            devices: vec!["/dev/ttyUSB0".to_owned()],
            recording_video: false,
            video_frames: 0,
        };
        let text: Vec<String> = status_lines(&status)
            .iter()
            .map(|line| line.spans.iter().map(|s| s.content.as_ref()).collect())
            .collect();
        assert!(text[1].contains("Packets 42"));
        assert!(text[2].contains("RSSI n/a"));
        assert!(text[4].contains("/dev/ttyUSB0"));
        assert!(text[5].contains("off"));
    }
}
