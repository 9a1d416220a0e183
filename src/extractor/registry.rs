//! 银行担保登记簿页面的抽取规则

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::Extractor;
use crate::models::{Attachment, DocumentField, PrimaryPage, SecondaryPage};

pub const MISSING_PAGE_PHRASE: &str = "Запрашиваемая страница не существует";
const ATTACHMENTS_LABEL: &str = "Прикрепленные файлы";
const GUARANTEE_INFO_TITLE: &str = "Информация о банковской гарантии";
const MAIN_INFO_SECTION: &str = "Сводная информация (верхний блок)";
const GUARANTEE_DATES_SECTION: &str = "Сроки и сумма (нижний блок)";
const STATUS_FIELD: &str = "Статус";
const NUMBER_FIELD: &str = "Номер банковской гарантии";

pub const TARGET_SECTIONS: [&str; 4] = [
    "Информация о банке-гаранте",
    "Информация о поставщике (подрядчике, исполнителе) – принципале",
    "Информация о заказчике-бенефициаре",
    GUARANTEE_INFO_TITLE,
];

struct Selectors {
    card: Selector,
    card_status: Selector,
    card_title: Selector,
    card_section: Selector,
    card_content_span: Selector,
    card_value: Selector,
    card_content_div: Selector,
    purchase_link: Selector,
    price: Selector,
    block_title: Selector,
    block_section: Selector,
    section_title: Selector,
    section_info: Selector,
    section_sub: Selector,
    sub_title: Selector,
    dates_table: Selector,
    th: Selector,
    data_row: Selector,
    td: Selector,
    attachments_block: Selector,
    block_heading: Selector,
    attachment: Selector,
    attachment_text: Selector,
    attachment_value: Selector,
    link: Selector,
}

fn sel(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("无效的选择器 {}: {:?}", css, e))
}

impl Selectors {
    fn new() -> Result<Self> {
        Ok(Self {
            card: sel("div.cardMainInfo")?,
            card_status: sel("div.cardMainInfo__status")?,
            card_title: sel("span.cardMainInfo__title")?,
            card_section: sel("div.cardMainInfo__section")?,
            card_content_span: sel("span.cardMainInfo__content")?,
            card_value: sel("div.cardMainInfo__value")?,
            card_content_div: sel("div.cardMainInfo__content")?,
            purchase_link: sel("span.cardMainInfo__purchaseLink")?,
            price: sel("div.price")?,
            block_title: sel("h2.blockInfo__title")?,
            block_section: sel("section.blockInfo__section")?,
            section_title: sel("span.section__title")?,
            section_info: sel("span.section__info")?,
            section_sub: sel("span.section__sub")?,
            sub_title: sel("span.title")?,
            dates_table: sel("table.blockInfo__table")?,
            th: sel("th")?,
            data_row: sel("tr.tableBlock__row")?,
            td: sel("td")?,
            attachments_block: sel("div.card-attachments__block")?,
            block_heading: sel("div.title")?,
            attachment: sel("div.attachment")?,
            attachment_text: sel("div.attachment__text")?,
            attachment_value: sel("div.attachment__value")?,
            link: sel("a[href]")?,
        })
    }
}

/// 登记簿页面抽取器
pub struct RegistryExtractor {
    selectors: Selectors,
    whitespace: Regex,
    number_pattern: Regex,
}

impl RegistryExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            selectors: Selectors::new()?,
            whitespace: Regex::new(r"\s+")?,
            number_pattern: Regex::new(r"№\s*([\w\-/]+)")?,
        })
    }

    fn normalize(&self, text: &str) -> String {
        self.whitespace
            .replace_all(&text.replace('\u{a0}', " "), " ")
            .trim()
            .to_string()
    }

    fn label(&self, text: &str) -> String {
        self.normalize(text).trim_end_matches(':').trim().to_string()
    }

    fn text_of(&self, element: ElementRef) -> String {
        self.normalize(&element.text().collect::<Vec<_>>().join(" "))
    }

    /// 拼接元素所有文本节点（不插入空格）后规范化
    fn value_of(&self, element: Option<ElementRef>) -> String {
        element
            .map(|e| self.normalize(&e.text().collect::<String>()))
            .unwrap_or_default()
    }

    fn parse_main_info(&self, doc: &Html, warnings: &mut Vec<String>) -> BTreeMap<String, String> {
        let s = &self.selectors;
        let mut fields = BTreeMap::new();

        let Some(card) = doc.select(&s.card).next() else {
            warnings.push("Top summary block not found".to_string());
            return fields;
        };

        for status in card.select(&s.card_status) {
            if let Some(title) = status.select(&s.card_title).next() {
                let text = self.text_of(title);
                if !text.is_empty() {
                    fields.entry(STATUS_FIELD.to_string()).or_insert(text);
                }
            }
        }

        for section in card.select(&s.card_section) {
            let title = section.select(&s.card_title).next();
            let content = section.select(&s.card_content_span).next();
            if let (Some(title), Some(content)) = (title, content) {
                let label = self.label(&self.text_of(title));
                if !label.is_empty() {
                    fields.insert(label, self.value_of(Some(content)));
                }
            }

            for value_div in section.select(&s.card_value) {
                let own_text: Vec<&str> = value_div
                    .children()
                    .filter_map(|node| node.value().as_text())
                    .map(|text| &**text)
                    .collect();
                let label = self.label(&own_text.join(" "));
                if let Some(content) = value_div.select(&s.card_content_div).next() {
                    if !label.is_empty() {
                        fields.insert(label, self.value_of(Some(content)));
                    }
                }
            }
        }

        if let Some(link) = card.select(&s.purchase_link).next() {
            let text = self.text_of(link);
            let number = text.replace('№', "");
            let number = number.trim();
            if !number.is_empty() {
                fields
                    .entry(NUMBER_FIELD.to_string())
                    .or_insert_with(|| self.normalize(number));
            }
        }

        if let Some(price) = card.select(&s.price).next() {
            let title = price.select(&s.card_title).next();
            let content = price.select(&s.card_content_span).next();
            if let (Some(title), Some(content)) = (title, content) {
                let label = self.label(&self.text_of(title));
                if !label.is_empty() {
                    fields.insert(label, self.value_of(Some(content)));
                }
            }
        }

        fields
    }

    fn parse_dates_table(&self, container: ElementRef, warnings: &mut Vec<String>) -> BTreeMap<String, String> {
        let s = &self.selectors;
        let mut fields = BTreeMap::new();
        let Some(table) = container.select(&s.dates_table).next() else {
            warnings.push("Guarantee dates table not found".to_string());
            return fields;
        };

        let headers: Vec<String> = table.select(&s.th).map(|th| self.label(&self.text_of(th))).collect();
        let data_rows = table
            .select(&s.data_row)
            .filter(|row| row.select(&s.td).next().is_some());

        for (row_index, row) in data_rows.enumerate() {
            let row_number = row_index + 1;
            let cells = row.select(&s.td).map(|td| self.value_of(Some(td)));
            for (header, cell) in headers.iter().zip(cells) {
                if header.is_empty() {
                    continue;
                }
                let label = if row_number == 1 {
                    header.clone()
                } else {
                    format!("{} (строка {})", header, row_number)
                };
                fields.insert(label, cell);
            }
        }
        fields
    }

    fn parse_block_section(&self, container: ElementRef) -> BTreeMap<String, String> {
        let s = &self.selectors;
        let mut fields = BTreeMap::new();
        for section in container.select(&s.block_section) {
            let title = section.select(&s.section_title).next();
            let info = section.select(&s.section_info).next();
            if let (Some(title), Some(info)) = (title, info) {
                let label = self.label(&self.text_of(title));
                if !label.is_empty() {
                    fields.insert(label, self.value_of(Some(info)));
                }
                continue;
            }

            if let Some(sub) = section.select(&s.section_sub).next() {
                for title in sub.select(&s.sub_title) {
                    let label = self.label(&self.text_of(title));
                    if label.is_empty() {
                        continue;
                    }
                    let info = next_sibling_with_class(title, "span", "info");
                    fields.insert(label, self.value_of(info));
                }
            }
        }
        fields
    }

    /// 文档页中标题为"Информация о банковской гарантии"的块
    fn guarantee_blocks<'a>(&'a self, doc: &'a Html) -> impl Iterator<Item = ElementRef<'a>> + 'a {
        let s = &self.selectors;
        doc.select(&s.attachments_block).filter(move |block| {
            block
                .select(&s.block_heading)
                .next()
                .is_some_and(|title| self.text_of(title) == GUARANTEE_INFO_TITLE)
        })
    }

    fn document_number(&self, attachment: ElementRef) -> String {
        let Some(number_el) = attachment
            .select(&self.selectors.attachment_value)
            .find(|el| el.text().collect::<String>().contains(GUARANTEE_INFO_TITLE))
        else {
            return String::new();
        };
        let text = self.text_of(number_el);
        if let Some((_, after)) = text.split_once('№') {
            if let Some(first) = after.split_whitespace().next() {
                return first.to_string();
            }
        }
        self.number_pattern
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }

    fn tooltip_text(&self, link: ElementRef) -> String {
        match link.value().attr("data-tooltip") {
            Some(tooltip) if !tooltip.is_empty() => {
                let fragment = Html::parse_fragment(tooltip);
                self.normalize(&fragment.root_element().text().collect::<Vec<_>>().join(" "))
            }
            _ => String::new(),
        }
    }
}

fn has_class(element: ElementRef, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

fn next_sibling_with_class<'a>(element: ElementRef<'a>, tag: &str, class: &str) -> Option<ElementRef<'a>> {
    element
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == tag && has_class(*el, class))
}

fn is_download_link(href: &str) -> bool {
    let href = href.to_lowercase();
    href.contains("download") || href.contains("/filestore/") || href.contains("file.html?uid")
}

impl Extractor for RegistryExtractor {
    fn parse_primary_page(&self, html: &str) -> PrimaryPage {
        let doc = Html::parse_document(html);
        let s = &self.selectors;
        let mut page = PrimaryPage::default();

        let main_fields = self.parse_main_info(&doc, &mut page.warnings);
        if !main_fields.is_empty() {
            page.sections.insert(MAIN_INFO_SECTION.to_string(), main_fields);
        }

        for header in doc.select(&s.block_title) {
            let section_name = self.text_of(header);
            if !TARGET_SECTIONS.contains(&section_name.as_str()) {
                continue;
            }
            let Some(container) = header.parent().and_then(ElementRef::wrap) else {
                continue;
            };

            let fields = self.parse_block_section(container);
            if fields.is_empty() {
                page.warnings
                    .push(format!("Section '{}' found but no fields parsed", section_name));
            }

            if section_name == GUARANTEE_INFO_TITLE {
                let table_fields = self.parse_dates_table(container, &mut page.warnings);
                if !table_fields.is_empty() {
                    page.sections.insert(GUARANTEE_DATES_SECTION.to_string(), table_fields);
                }
            }
            page.sections.insert(section_name, fields);
        }

        for required in TARGET_SECTIONS {
            if !page.sections.contains_key(required) {
                page.warnings.push(format!("Section '{}' not found", required));
            }
        }
        page
    }

    fn parse_secondary_page(&self, html: &str) -> SecondaryPage {
        let doc = Html::parse_document(html);
        let s = &self.selectors;
        let mut page = SecondaryPage::default();
        let mut seen: HashSet<(u32, String)> = HashSet::new();

        for block in self.guarantee_blocks(&doc) {
            for (position, attachment) in block.select(&s.attachment).enumerate() {
                let document_index = position as u32 + 1;
                let document_number = self.normalize(&self.document_number(attachment));

                if !document_number.is_empty() {
                    page.document_metadata.push(DocumentField {
                        field_name: NUMBER_FIELD.to_string(),
                        field_value: document_number.clone(),
                        document_index,
                        document_number: document_number.clone(),
                    });
                }

                for label_div in attachment.select(&s.attachment_text) {
                    let label = self.label(&self.text_of(label_div));
                    if label.is_empty() || label == ATTACHMENTS_LABEL {
                        continue;
                    }
                    let value = next_sibling_with_class(label_div, "div", "attachment__value");
                    page.document_metadata.push(DocumentField {
                        field_name: label,
                        field_value: self.value_of(value),
                        document_index,
                        document_number: document_number.clone(),
                    });
                }

                for link in attachment.select(&s.link) {
                    let Some(href) = link.value().attr("href") else {
                        continue;
                    };
                    if href.contains("signview") || !is_download_link(href) {
                        continue;
                    }
                    if !seen.insert((document_index, href.to_string())) {
                        continue;
                    }
                    let mut original_filename = self.tooltip_text(link);
                    if original_filename.is_empty() {
                        original_filename = self.text_of(link);
                    }
                    page.attachments.push(Attachment {
                        download_url: href.to_string(),
                        original_filename,
                        document_index,
                        document_number: document_number.clone(),
                    });
                }
            }
        }

        if page.attachments.is_empty() {
            page.warnings.push("Attachments not found in document blocks".to_string());
        }
        page
    }

    fn is_missing_page(&self, html: &str) -> bool {
        html.contains(MISSING_PAGE_PHRASE)
    }
}
