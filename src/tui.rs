use std::io::{self, Write};

use color_eyre::Result;
use crossterm::{
    queue,
    style::{
        Attribute, Color as CrosstermColor, Print, SetAttribute, SetBackgroundColor,
        SetForegroundColor,
    },
};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Cell, Row, Table, Widget},
};

use crate::event::Info;

const FALLBACK_WIDTH: u16 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionListRow {
    pub name: String,
    pub directory: String,
    pub marker: String,
    pub pid: String,
    pub last_active: String,
}

pub fn render_sessions_table(rows: &[SessionListRow]) -> Result<()> {
    let buffer = sessions_buffer(rows, terminal_width());
    print_buffer(&buffer)
}

/// Listening ports and local sockets of a guest, one table each.
pub fn render_info_tables(info: &Info) -> Result<()> {
    let width = terminal_width();
    print_buffer(&ports_buffer(info, width))?;
    print_buffer(&sockets_buffer(info, width))
}

fn sessions_buffer(rows: &[SessionListRow], width: u16) -> Buffer {
    let header = header_row(["Session", "Directory", "Marker", "PID", "Last Active"]);
    let body = rows.iter().map(|row| {
        let marker_style = if row.marker == "present" {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        Row::new(vec![
            Cell::from(row.name.clone()).style(Style::default().fg(Color::Cyan)),
            Cell::from(row.directory.clone()),
            Cell::from(row.marker.clone()).style(marker_style),
            Cell::from(row.pid.clone()),
            Cell::from(row.last_active.clone()),
        ])
    });
    let widths = [
        Constraint::Percentage(18),
        Constraint::Percentage(40),
        Constraint::Percentage(12),
        Constraint::Percentage(10),
        Constraint::Percentage(20),
    ];
    table_buffer("Sessions", header, body.collect(), &widths, width)
}

fn ports_buffer(info: &Info, width: u16) -> Buffer {
    let header = header_row(["IP", "Port"]);
    let body = info
        .local_ports
        .iter()
        .map(|endpoint| {
            Row::new(vec![
                Cell::from(endpoint.ip.to_string()),
                Cell::from(endpoint.port.to_string()).style(Style::default().fg(Color::Green)),
            ])
        })
        .collect();
    let widths = [Constraint::Percentage(60), Constraint::Percentage(40)];
    table_buffer("Listening Ports", header, body, &widths, width)
}

fn sockets_buffer(info: &Info, width: u16) -> Buffer {
    let header = header_row(["Path"]);
    let body = info
        .local_sockets
        .iter()
        .map(|path| Row::new(vec![Cell::from(path.clone())]))
        .collect();
    table_buffer(
        "Local Sockets",
        header,
        body,
        &[Constraint::Percentage(100)],
        width,
    )
}

fn header_row<const N: usize>(titles: [&'static str; N]) -> Row<'static> {
    Row::new(titles.map(Cell::from))
        .style(Style::default().add_modifier(Modifier::BOLD))
}

fn table_buffer(
    title: &'static str,
    header: Row<'static>,
    body: Vec<Row<'static>>,
    widths: &[Constraint],
    width: u16,
) -> Buffer {
    // borders + header + rows
    let height = (body.len() as u16).saturating_add(3);
    let area = Rect::new(0, 0, width.max(20), height);
    let mut buffer = Buffer::empty(area);
    Table::new(body, widths.to_vec())
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1)
        .render(area, &mut buffer);
    buffer
}

fn terminal_width() -> u16 {
    match crossterm::terminal::size() {
        Ok((width, _)) if width > 0 => width,
        _ => FALLBACK_WIDTH,
    }
}

fn print_buffer(buffer: &Buffer) -> Result<()> {
    let mut stdout = io::stdout().lock();
    write_buffer_with_style(buffer, &mut stdout)?;
    stdout.flush()?;
    Ok(())
}

fn write_buffer_with_style(buffer: &Buffer, out: &mut impl Write) -> io::Result<()> {
    let area = buffer.area;
    for y in 0..area.height {
        let mut current: Option<(CrosstermColor, CrosstermColor, Modifier)> = None;
        for x in 0..area.width {
            let cell = &buffer[(x, y)];
            if cell.skip {
                continue;
            }
            let style = (map_color(cell.fg), map_color(cell.bg), cell.modifier);
            if current != Some(style) {
                queue!(
                    out,
                    SetAttribute(Attribute::Reset),
                    SetForegroundColor(style.0),
                    SetBackgroundColor(style.1)
                )?;
                queue_modifier(out, style.2)?;
                current = Some(style);
            }
            let symbol = cell.symbol();
            queue!(out, Print(if symbol.is_empty() { " " } else { symbol }))?;
        }
        queue!(
            out,
            SetAttribute(Attribute::Reset),
            SetForegroundColor(CrosstermColor::Reset),
            SetBackgroundColor(CrosstermColor::Reset),
            Print("\n")
        )?;
    }
    Ok(())
}

fn map_color(color: Color) -> CrosstermColor {
    match color {
        Color::Reset => CrosstermColor::Reset,
        Color::Black => CrosstermColor::Black,
        Color::Red => CrosstermColor::DarkRed,
        Color::Green => CrosstermColor::DarkGreen,
        Color::Yellow => CrosstermColor::DarkYellow,
        Color::Blue => CrosstermColor::DarkBlue,
        Color::Magenta => CrosstermColor::DarkMagenta,
        Color::Cyan => CrosstermColor::DarkCyan,
        Color::Gray => CrosstermColor::Grey,
        Color::DarkGray => CrosstermColor::DarkGrey,
        Color::LightRed => CrosstermColor::Red,
        Color::LightGreen => CrosstermColor::Green,
        Color::LightYellow => CrosstermColor::Yellow,
        Color::LightBlue => CrosstermColor::Blue,
        Color::LightMagenta => CrosstermColor::Magenta,
        Color::LightCyan => CrosstermColor::Cyan,
        Color::White => CrosstermColor::White,
        Color::Rgb(r, g, b) => CrosstermColor::Rgb { r, g, b },
        Color::Indexed(i) => CrosstermColor::AnsiValue(i),
    }
}

fn queue_modifier(out: &mut impl Write, modifier: Modifier) -> io::Result<()> {
    const ATTRIBUTES: [(Modifier, Attribute); 5] = [
        (Modifier::BOLD, Attribute::Bold),
        (Modifier::DIM, Attribute::Dim),
        (Modifier::ITALIC, Attribute::Italic),
        (Modifier::UNDERLINED, Attribute::Underlined),
        (Modifier::REVERSED, Attribute::Reverse),
    ];
    for (flag, attribute) in ATTRIBUTES {
        if modifier.contains(flag) {
            queue!(out, SetAttribute(attribute))?;
        }
    }
    Ok(())
}
