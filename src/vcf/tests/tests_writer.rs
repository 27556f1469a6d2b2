//! Writer output and field substitution.

#[cfg(test)]
mod tests {
    use crate::validation::VariantFields;
    use crate::vcf::{LineEnding, Record, VcfReader, VcfWriter};
    use std::io::Cursor;

    const HEADER: &str = "##fileformat=VCFv4.2\n\
                          #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tNA001\n";

    fn copy(text: &str) -> String {
        let reader = VcfReader::new(Cursor::new(text.as_bytes().to_vec())).unwrap();
        let mut writer = VcfWriter::new(Vec::new());
        writer.write_header(reader.header()).unwrap();
        for record in reader {
            writer.write_record(&record.unwrap()).unwrap();
        }
        String::from_utf8(writer.finish().unwrap()).unwrap()
    }

    fn fields(chrom: &str, pos: u64) -> VariantFields {
        VariantFields {
            chrom: chrom.into(),
            pos,
            id: Some("rs77".into()),
            reference: "T".into(),
            alt: None,
        }
    }

    #[test]
    fn copy_is_byte_identical() {
        let text = format!(
            "{HEADER}chr1\t1\trs1\tA\tG\t9\tPASS\tAC=1\tGT:DP\t0/1:4\r\n\
             chr1\t2\t.\tA\t.\t.\t.\t.\tGT\t./.\n"
        );
        assert_eq!(copy(&text), text);
    }

    #[test]
    fn missing_final_newline_is_preserved() {
        let text = format!("{HEADER}chr1\t1\t.\tA\t.\t.\t.\t.");
        assert_eq!(copy(&text), text);
    }

    #[test]
    fn newline_is_supplied_when_a_record_follows() {
        let text = format!("{HEADER}chr1\t1\t.\tA\t.\t.\t.\t.");
        let reader = VcfReader::new(Cursor::new(text.clone().into_bytes())).unwrap();
        let header = reader.header().clone();
        let last = reader.map(Result::unwrap).last().unwrap();

        let mut writer = VcfWriter::new(Vec::new());
        writer.write_header(&header).unwrap();
        writer.write_record(&last).unwrap();
        let appended = Record::appended(&fields("chr2", 5), Some(&last), writer.line_ending());
        writer.write_record(&appended).unwrap();
        assert_eq!(writer.records_written(), 2);

        let out = String::from_utf8(writer.finish().unwrap()).unwrap();
        assert_eq!(out, format!("{text}\nchr2\t5\trs77\tT\t.\t.\t.\t.\n"));
    }

    #[test]
    fn substitution_keeps_trailing_columns() {
        let record = Record::parse(
            "chr1\t100\trs1\tA\tG\t30\tPASS\tDP=9\tGT\t0/1",
            LineEnding::Lf,
            3,
        )
        .unwrap();
        let edited = record.with_fields(&fields("chrX", 7));
        assert_eq!(edited.text(), "chrX\t7\trs77\tT\t.\t30\tPASS\tDP=9\tGT\t0/1");
        assert_eq!(edited.pos(), 7);
    }

    #[test]
    fn appended_record_inherits_format_and_samples() {
        let template = Record::parse(
            "chr1\t100\trs1\tA\tG\t30\tPASS\tDP=9\tGT:AD\t0/1:3,4\t1/1:0,8",
            LineEnding::Lf,
            3,
        )
        .unwrap();
        let record = Record::appended(&fields("chr3", 42), Some(&template), LineEnding::Lf);
        assert_eq!(
            record.text(),
            "chr3\t42\trs77\tT\t.\t.\t.\t.\tGT:AD\t0/1:3,4\t1/1:0,8"
        );

        let bare = Record::appended(&fields("chr3", 42), None, LineEnding::Lf);
        assert_eq!(bare.text(), "chr3\t42\trs77\tT\t.\t.\t.\t.");
    }

    #[test]
    fn appended_record_keeps_crlf_endings() {
        let text = format!(
            "{HEADER}chr1\t1\t.\tA\t.\t.\t.\t.\r\n\
             chr1\t2\t.\tA\t.\t.\t.\t."
        );
        let reader = VcfReader::new(Cursor::new(text.clone().into_bytes())).unwrap();
        let header = reader.header().clone();
        let records: Vec<_> = reader.map(Result::unwrap).collect();
        let last = records.last().unwrap();
        assert_eq!(last.ending(), LineEnding::None);

        let mut writer = VcfWriter::new(Vec::new());
        writer.write_header(&header).unwrap();
        for record in &records {
            writer.write_record(record).unwrap();
        }
        assert_eq!(writer.line_ending(), LineEnding::CrLf);
        let appended = Record::appended(&fields("chr2", 5), Some(last), writer.line_ending());
        assert_eq!(appended.ending(), LineEnding::CrLf);
        writer.write_record(&appended).unwrap();

        let out = String::from_utf8(writer.finish().unwrap()).unwrap();
        assert_eq!(out, format!("{text}\r\nchr2\t5\trs77\tT\t.\t.\t.\t.\r\n"));
    }
}
