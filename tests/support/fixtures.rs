//! A fake SEPOMEX export site served by wiremock.

use std::io::Write;

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

pub const PAGE_PATH: &str = "/CodigoPostal_Exportar.aspx";

/// Landing page publishing the 5 January 2024 catalogue.
pub const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html><head><title>Correos de México | Descarga de Códigos Postales</title></head>
<body>
<form name="form1" method="post" action="./CodigoPostal_Exportar.aspx" id="form1">
<input type="hidden" name="__VIEWSTATE" id="__VIEWSTATE" value="dDwtMTI3OTMzNDM4NDs7Pg==" />
<input type="hidden" name="__VIEWSTATEGENERATOR" id="__VIEWSTATEGENERATOR" value="BE1A4F7C" />
<input type="hidden" name="__EVENTVALIDATION" id="__EVENTVALIDATION" value="wEdAAk4Rz" />
<p>Catálogo Nacional de Códigos Postales. Última actualización: 05/01/2024</p>
<select name="cboEdo" id="cboEdo"><option value="00">Todos</option></select>
<input type="image" name="btnDescarga" id="btnDescarga" src="img/descarga.png" />
</form>
</body></html>"#;

/// Pipe-delimited extract: two header lines, three rows, two postal codes.
pub const EXTRACT_TEXT: &str = "El Catálogo Nacional de Códigos Postales, es elaborado por Correos de México\n\
d_codigo|d_asenta|d_tipo_asenta|D_mnpio|d_estado|d_ciudad|d_CP|c_estado|c_oficina|c_CP|c_tipo_asenta|c_mnpio|id_asenta_cpcons|d_zona|c_cve_ciudad\n\
01000|San Ángel|Colonia|Álvaro Obregón|Ciudad de México|Ciudad de México|01001|09|01001||09|010|0001|Urbano|01\n\
01000|Tlacopac|Colonia|Álvaro Obregón|Ciudad de México|Ciudad de México|01001|09|01001||09|010|0002|Urbano|01\n\
44100|Guadalajara Centro|Colonia|Guadalajara|Jalisco|Guadalajara|44101|14|44101||09|039|0001|Urbano|03\n";

/// Zip archive holding `text` encoded as windows-1252.
#[must_use]
pub fn archive_bytes(text: &str) -> Vec<u8> {
    let (encoded, _, _) = encoding_rs::WINDOWS_1252.encode(text);
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file("CPdescarga.txt", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(&encoded).unwrap();
    writer.finish().unwrap().into_inner()
}

#[must_use]
pub fn page_url(server: &MockServer) -> String {
    format!("{}{PAGE_PATH}", server.uri())
}

/// Serves the landing page on GET and `archive` on a POST carrying the
/// page's session tokens.
pub async fn mount_export_site(server: &MockServer, archive: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(PAGE_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(LANDING_PAGE)
                .insert_header("Content-Type", "text/html; charset=utf-8"),
        )
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(PAGE_PATH))
        .and(body_string_contains("__EVENTVALIDATION=wEdAAk4Rz"))
        .and(body_string_contains("rblTipo=txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(archive)
                .insert_header("Content-Type", "application/x-zip-compressed"),
        )
        .mount(server)
        .await;
}
