use std::io::Write;

use anyhow::Result;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Row, Table, cell, row};

use coalesce_service::quakes::Quake;

fn quakes_table(quakes: &[Quake]) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Time", "Code", "Mag", "Place", "Longitude", "Latitude"]);

    for quake in quakes {
        let mut row = Row::empty();

        row.add_cell(cell!(quake.time.format("%Y-%m-%d %H:%M:%S")));
        row.add_cell(cell!(quake.code));
        row.add_cell(cell!(r->format!("{:.1}", quake.magnitude)));
        row.add_cell(cell!(quake.place));

        match &quake.location {
            Some(location) => {
                row.add_cell(cell!(r->format!("{:.3}", location.longitude())));
                row.add_cell(cell!(r->format!("{:.3}", location.latitude())));
            }
            None => row.add_cell(cell!("").with_hspan(2)),
        }

        table.add_row(row);
    }

    table
}

pub fn print_table(quakes: &[Quake]) {
    if quakes.is_empty() {
        return;
    }

    quakes_table(quakes).printstd();
}

fn write_json(mut writer: impl Write, quakes: &[Quake]) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, quakes)?;
    writeln!(writer)?;
    Ok(())
}

pub fn print_json(quakes: &[Quake]) -> Result<()> {
    write_json(std::io::stdout().lock(), quakes)
}
