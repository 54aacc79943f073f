//! Parser for `mtx status` output.
//!
//! Format (per the header line this crate's changer emits the same shape
//! for): `Storage Changer <path>: D drives, S slots ( M Import/Export )`,
//! followed by `Data Transfer Element N:...` rows and `Storage Element
//! N[ IMPORT/EXPORT]:...` rows, in ascending element-number order.

use nom::{
    bytes::complete::{tag, take_while},
    character::complete::{char, newline},
    combinator::opt,
};

use crate::changer::{DriveStatus, ElementStatus, MtxStatus};
use crate::parsing::{parse_complete, parse_error, parse_u64, multispace1, IResult};

fn next_line(i: &str) -> IResult<&str, &str> {
    let (i, line) = take_while(|c| c != '\n')(i)?;
    if i.is_empty() {
        Ok((i, line))
    } else {
        Ok((&i[1..], line))
    }
}

fn header(i: &str) -> IResult<&str, ()> {
    let (i, _) = tag("Storage Changer")(i)?;
    let (i, _) = next_line(i)?;
    Ok((i, ()))
}

fn drive_status(i: &str) -> IResult<&str, DriveStatus> {
    if let Some(rest) = i.strip_suffix("Empty") {
        return Ok((
            rest,
            DriveStatus {
                loaded_slot: None,
                status: ElementStatus::Empty,
            },
        ));
    }

    let (mut i, _) = tag("Full (")(i)?;
    let mut loaded_slot = None;

    if let Some(n) = i.strip_prefix("Storage Element ") {
        let (n, id) = parse_u64(n)?;
        loaded_slot = Some(id);
        let (n, _) = tag(" Loaded")(n)?;
        i = n;
    } else {
        let (n, _) = take_while(|c| c != ')' && c != '\n')(i)?;
        i = n;
    }

    let (i, _) = char(')')(i)?;

    if let Some(i) = i.strip_prefix(":VolumeTag = ") {
        let (i, tag) = take_while(|c| c != ' ' && c != ':' && c != '\n')(i)?;
        let (i, _) = take_while(|c| c != '\n')(i)?;
        return Ok((
            i,
            DriveStatus {
                loaded_slot,
                status: ElementStatus::VolumeTag(tag.to_string()),
            },
        ));
    }

    let (i, _) = take_while(|c| c != '\n')(i)?;
    Ok((
        i,
        DriveStatus {
            loaded_slot,
            status: ElementStatus::Full,
        },
    ))
}

fn slot_status(i: &str) -> IResult<&str, ElementStatus> {
    if let Some(rest) = i.strip_prefix("Empty") {
        return Ok((rest, ElementStatus::Empty));
    }

    if let Some(n) = i.strip_prefix("Full ") {
        if let Some(n) = n.strip_prefix(":VolumeTag=") {
            let (n, tag) = take_while(|c| c != ' ' && c != ':' && c != '\n')(n)?;
            let (n, _) = take_while(|c| c != '\n')(n)?;
            return Ok((n, ElementStatus::VolumeTag(tag.to_string())));
        }
        let (n, _) = take_while(|c| c != '\n')(n)?;
        return Ok((n, ElementStatus::Full));
    }

    Err(parse_error(i, "unexpected element status"))
}

fn data_transfer_element(i: &str) -> IResult<&str, (u64, DriveStatus)> {
    let (i, _) = tag("Data Transfer Element")(i)?;
    let (i, _) = multispace1(i)?;
    let (i, id) = parse_u64(i)?;
    let (i, _) = char(':')(i)?;
    let (i, status) = drive_status(i)?;
    let (i, _) = newline(i)?;
    Ok((i, (id, status)))
}

fn storage_element(i: &str) -> IResult<&str, (u64, bool, ElementStatus)> {
    let (i, _) = take_while(|c| c == ' ')(i)?;
    let (i, _) = tag("Storage Element")(i)?;
    let (i, _) = multispace1(i)?;
    let (i, id) = parse_u64(i)?;
    let (i, mail) = opt(tag(" IMPORT/EXPORT"))(i)?;
    let (i, _) = char(':')(i)?;
    let (i, status) = slot_status(i)?;
    let (i, _) = newline(i)?;
    Ok((i, (id, mail.is_some(), status)))
}

fn status(i: &str) -> IResult<&str, MtxStatus> {
    let (mut i, _) = header(i)?;

    let mut drives = Vec::new();
    while let Ok((rest, (id, drive))) = data_transfer_element(i) {
        if id != drives.len() as u64 {
            return Err(parse_error(i, "unexpected drive element number"));
        }
        i = rest;
        drives.push(drive);
    }

    let mut slots = Vec::new();
    while let Ok((rest, (id, mail, status))) = storage_element(i) {
        if id != slots.len() as u64 + 1 {
            return Err(parse_error(i, "unexpected storage element number"));
        }
        i = rest;
        slots.push((mail, status));
    }

    Ok((i, MtxStatus { drives, slots }))
}

pub fn parse_status(text: &str) -> Result<MtxStatus, anyhow::Error> {
    parse_complete("mtx status", text, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Storage Changer /dev/sg0: 2 drives, 4 slots ( 1 Import/Export )\n\
Data Transfer Element 0:Empty\n\
Data Transfer Element 1:Full (Storage Element 3 Loaded):VolumeTag = TEST001L6\n\
      Storage Element 1:Empty\n\
      Storage Element 2:Full :VolumeTag=TEST002L6\n\
      Storage Element 3:Empty\n\
      Storage Element 4 IMPORT/EXPORT:Empty\n";

    #[test]
    fn parses_sample_status() {
        let status = parse_status(SAMPLE).unwrap();
        assert_eq!(status.drives.len(), 2);
        assert_eq!(status.drives[0].status, ElementStatus::Empty);
        assert_eq!(status.drives[1].loaded_slot, Some(3));
        assert_eq!(
            status.drives[1].status,
            ElementStatus::VolumeTag("TEST001L6".into())
        );

        assert_eq!(status.slots.len(), 4);
        assert_eq!(status.slots[1].1, ElementStatus::VolumeTag("TEST002L6".into()));
        assert!(status.slots[3].0);
    }
}
